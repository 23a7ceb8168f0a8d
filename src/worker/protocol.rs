//! The worker protocol state machine.
//!
//! Both sides of the orchestrator/worker boundary honor this machine:
//! the orchestrator never assumes a worker reached a state it was not
//! told about, and a worker that reports an illegal transition is
//! treated as misbehaving.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol states for a single task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No task assigned; the only state that accepts work.
    Idle,
    /// Task assigned, worktree being prepared.
    Assigned,
    /// Actively implementing the task.
    Executing,
    /// Running the task's verification command.
    Verifying,
    /// Reviewing its own diff before declaring done.
    SelfReview,
    /// Stuck on something external; may resume executing when unblocked.
    Blocked,
    /// Checkpointed out for handoff; a fresh worker takes the task.
    Waiting,
    /// Task attempt succeeded.
    Complete,
    /// Task attempt failed.
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Assigned => "assigned",
            WorkerState::Executing => "executing",
            WorkerState::Verifying => "verifying",
            WorkerState::SelfReview => "self_review",
            WorkerState::Blocked => "blocked",
            WorkerState::Waiting => "waiting",
            WorkerState::Complete => "complete",
            WorkerState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Tracks one worker's position in the protocol, including the bounded
/// self-review revision loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProtocol {
    state: WorkerState,
    revisions: u32,
    max_revisions: u32,
}

impl WorkerProtocol {
    pub fn new(max_revisions: u32) -> Self {
        Self {
            state: WorkerState::Idle,
            revisions: 0,
            max_revisions,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn revisions(&self) -> u32 {
        self.revisions
    }

    /// Attempt a transition. Illegal transitions are side-effect-free
    /// and return false; the caller decides whether that is fatal.
    ///
    /// `SelfReview -> Executing` consumes one revision; once
    /// `max_revisions` revisions have been taken the edge is refused
    /// and the worker must go `SelfReview -> Failed` instead.
    pub fn transition(&mut self, next: WorkerState) -> bool {
        use WorkerState::*;
        let legal = match (self.state, next) {
            (Idle, Assigned) => true,
            (Assigned, Executing) => true,
            (Executing, Verifying | Blocked | Waiting | Failed) => true,
            (Verifying, SelfReview | Failed) => true,
            (SelfReview, Complete) => true,
            (SelfReview, Executing) => self.revisions < self.max_revisions,
            // Exhausted revision loops exit through Failed.
            (SelfReview, Failed) => true,
            (Blocked, Executing) => true,
            (Waiting, Idle) => true,
            (Complete | Failed, Idle) => true,
            _ => false,
        };
        if !legal {
            return false;
        }
        if self.state == SelfReview && next == Executing {
            self.revisions += 1;
        }
        if next == Idle {
            // New attempt starts with a fresh revision budget.
            self.revisions = 0;
        }
        self.state = next;
        true
    }

    pub fn can_accept_task(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Terminal for the current task attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, WorkerState::Complete | WorkerState::Failed)
    }

    /// Return to `Idle` from a terminal state. No-op elsewhere.
    pub fn reset(&mut self) -> bool {
        if self.is_terminal() {
            self.transition(WorkerState::Idle)
        } else {
            false
        }
    }
}
