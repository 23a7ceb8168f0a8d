//! Workers: the protocol state machine, process launchers, and the pool.

pub mod launcher;
pub mod pool;
pub mod protocol;

pub use launcher::{LaunchRequest, NullLauncher, NullOutcome, SubprocessLauncher, WorkerLauncher};
pub use pool::{Worker, WorkerEvent, WorkerPool};
pub use protocol::{WorkerProtocol, WorkerState};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex chars, for branch names and log lines.
    pub fn short(&self) -> String {
        self.0.to_string().chars().take(8).collect()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
