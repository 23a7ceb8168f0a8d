//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work assigned to workers. Each task
//! tracks its status, file ownership claims, verification command,
//! assignment, and timing.

use crate::error::{Error, Result};
use crate::worker::WorkerId;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Unique identifier for a task, matching `PREFIX-NNN` (e.g. `TASK-001`).
///
/// Ids come from the task-graph document, not generated internally, so
/// the constructor validates the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z]+-[0-9]+$").expect("valid pattern"))
}

impl TaskId {
    /// Parse and validate a task id.
    pub fn parse(s: &str) -> Result<Self> {
        if id_pattern().is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidTaskId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// File ownership claims for a task.
///
/// `create` and `modify` together form the exclusive claim: within a
/// level no other task may list any of these paths. `read` is
/// unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub create: BTreeSet<String>,
    #[serde(default)]
    pub modify: BTreeSet<String>,
    #[serde(default)]
    pub read: BTreeSet<String>,
}

impl FileSet {
    /// All paths this task claims exclusively (create plus modify).
    pub fn exclusive(&self) -> impl Iterator<Item = &String> {
        self.create.iter().chain(self.modify.iter())
    }

    /// Paths listed in both `create` and `modify`. The sets must be
    /// disjoint; overlap is a validation error at graph build time.
    pub fn internal_overlap(&self) -> Vec<String> {
        self.create.intersection(&self.modify).cloned().collect()
    }
}

/// Verification command for a task: the quality check a worker runs
/// before reporting success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default = "default_verification_timeout")]
    pub timeout_seconds: u64,
}

fn default_verification_timeout() -> u64 {
    300
}

/// Task status in its lifecycle.
///
/// Mutated only by the orchestrator in response to worker reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet assigned.
    #[default]
    Pending,
    /// Task is being executed by a worker.
    Running,
    /// Task completed and verified.
    Complete,
    /// Task failed (verification or worker error).
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task cannot proceed without intervention (retries exhausted).
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// A single task in the execution graph.
///
/// Immutable once the graph is validated, except for the status and
/// assignment bookkeeping the orchestrator maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    /// Derived by the graph builder; any hint in the source document is
    /// ignored.
    pub level: usize,
    pub dependencies: BTreeSet<TaskId>,
    pub files: FileSet,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub verification: Verification,
    #[serde(default)]
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Attempts consumed so far (initial run plus retries).
    #[serde(default)]
    pub attempts: u32,
}

impl Task {
    /// Start the task under the given worker.
    pub fn start(&mut self, worker_id: WorkerId) {
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker_id);
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Mark the task as complete.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Complete;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
        self.worker_id = None;
    }

    /// Mark the task as blocked.
    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.worker_id = None;
    }

    /// Requeue the task for another attempt. `force` also clears the
    /// attempt counter.
    pub fn reset_for_retry(&mut self, force: bool) {
        self.status = TaskStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.completed_at = None;
        if force {
            self.attempts = 0;
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, TaskStatus::Complete)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.status, TaskStatus::Blocked { .. })
    }

    /// Terminal for the level barrier: complete, or stuck past recovery.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Complete | TaskStatus::Blocked { .. }
        )
    }

    pub fn is_assignable(&self) -> bool {
        matches!(self.status, TaskStatus::Pending) && self.worker_id.is_none()
    }
}
