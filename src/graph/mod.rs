//! Task graph: the dependency DAG a feature run executes against.

pub mod build;
pub mod task;

pub use build::{GraphSpec, TaskGraph, TaskSpec};
pub use task::{FileSet, Task, TaskId, TaskStatus, Verification};
