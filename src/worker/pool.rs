//! The worker pool: slot accounting and per-worker bookkeeping.
//!
//! The pool is owned by the orchestrator's single coordinating loop and
//! is never touched concurrently, so it is a plain struct rather than a
//! shared lock.

use crate::error::{Error, Result};
use crate::graph::TaskId;
use crate::state::Checkpoint;
use crate::worker::protocol::{WorkerProtocol, WorkerState};
use crate::worker::WorkerId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Status reported from a worker to the orchestrator.
#[derive(Debug)]
pub enum WorkerEvent {
    StateReported {
        worker_id: WorkerId,
        state: WorkerState,
    },
    Heartbeat {
        worker_id: WorkerId,
        context_usage: f64,
    },
    Checkpointed {
        worker_id: WorkerId,
        checkpoint: Box<Checkpoint>,
    },
    Errored {
        worker_id: WorkerId,
        message: String,
    },
    /// The worker process is gone; terminal states should already have
    /// been reported.
    Exited {
        worker_id: WorkerId,
    },
}

/// One live worker and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub protocol: WorkerProtocol,
    pub task: Option<TaskId>,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub context_usage: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Last error message reported by the worker, if any.
    pub last_error: Option<String>,
}

impl Worker {
    pub fn state(&self) -> WorkerState {
        self.protocol.state()
    }
}

/// Bounded set of live workers.
pub struct WorkerPool {
    workers: HashMap<WorkerId, Worker>,
    max_concurrent: usize,
    max_revisions: u32,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, max_revisions: u32) -> Self {
        Self {
            workers: HashMap::new(),
            max_concurrent,
            max_revisions,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// True if a new worker can be admitted under `effective_max`
    /// (backpressure may give a value below the configured maximum).
    pub fn has_capacity(&self, effective_max: usize) -> bool {
        let cap = effective_max.min(self.max_concurrent);
        self.workers.len() < cap
    }

    /// Admit a new worker for a task. The worker enters `Assigned`.
    pub fn admit(
        &mut self,
        id: WorkerId,
        task: TaskId,
        worktree_path: PathBuf,
        branch_name: String,
    ) -> Result<&Worker> {
        if self.workers.len() >= self.max_concurrent {
            return Err(Error::NoCapacity {
                max: self.max_concurrent,
            });
        }
        let mut protocol = WorkerProtocol::new(self.max_revisions);
        // Idle -> Assigned always holds for a fresh protocol.
        protocol.transition(WorkerState::Assigned);
        let now = Utc::now();
        let worker = Worker {
            id,
            protocol,
            task: Some(task),
            worktree_path,
            branch_name,
            context_usage: 0.0,
            last_heartbeat: now,
            started_at: now,
            last_error: None,
        };
        Ok(self.workers.entry(id).or_insert(worker))
    }

    pub fn get(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    /// Apply a reported protocol state. `Ok(false)` means the report
    /// was an illegal transition and was ignored.
    pub fn apply_state(&mut self, id: &WorkerId, state: WorkerState) -> Result<bool> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| Error::WorkerNotFound(id.to_string()))?;
        worker.last_heartbeat = Utc::now();
        Ok(worker.protocol.transition(state))
    }

    pub fn heartbeat(&mut self, id: &WorkerId, context_usage: f64) -> Result<()> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| Error::WorkerNotFound(id.to_string()))?;
        worker.last_heartbeat = Utc::now();
        worker.context_usage = context_usage.clamp(0.0, 1.0);
        Ok(())
    }

    /// Workers silent past the stall timeout, excluding terminal and
    /// waiting workers (those are reconciled, not stalled).
    pub fn stalled(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<WorkerId> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.workers
            .values()
            .filter(|w| !w.protocol.is_terminal() && w.state() != WorkerState::Waiting)
            .filter(|w| now - w.last_heartbeat > timeout)
            .map(|w| w.id)
            .collect()
    }

    pub fn remove(&mut self, id: &WorkerId) -> Option<Worker> {
        self.workers.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// The worker currently holding a task, if any.
    pub fn worker_for_task(&self, task: &TaskId) -> Option<&Worker> {
        self.workers.values().find(|w| w.task.as_ref() == Some(task))
    }
}
