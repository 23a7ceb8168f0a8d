pub mod config;
pub mod error;
pub mod graph;
pub mod log;
pub mod orchestrator;
pub mod resilience;
pub mod state;
pub mod worker;
pub mod worktree;

pub use error::{Error, Result};
pub use graph::{GraphSpec, Task, TaskGraph, TaskId, TaskStatus};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use worker::{WorkerId, WorkerState};
