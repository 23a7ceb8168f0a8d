//! Durable execution state and its atomic persistence path.
//!
//! The orchestrator is the only writer. Every state-affecting event
//! rewrites the whole document through `StatePersistence::save`, which
//! stages the bytes in a temp file in the destination directory and
//! renames it into place, so readers never observe a torn file and a
//! crash mid-write leaves the previous state intact.

use crate::error::{Error, Result};
use crate::flog_debug;
use crate::graph::{Task, TaskId, TaskStatus};
use crate::worker::{Worker, WorkerId, WorkerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Bumped on any incompatible change to the state document.
pub const SCHEMA_VERSION: u32 = 1;

/// Snapshot of one task inside the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status.clone(),
            worker_id: task.worker_id,
            started_at: task.started_at,
            completed_at: task.completed_at,
            attempts: task.attempts,
        }
    }
}

/// Snapshot of one worker inside the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub state: WorkerState,
    pub task: Option<TaskId>,
    pub branch_name: String,
    pub worktree_path: String,
    pub context_usage: f64,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&Worker> for WorkerRecord {
    fn from(worker: &Worker) -> Self {
        Self {
            state: worker.state(),
            task: worker.task.clone(),
            branch_name: worker.branch_name.clone(),
            worktree_path: worker.worktree_path.display().to_string(),
            context_usage: worker.context_usage,
            last_heartbeat: worker.last_heartbeat,
        }
    }
}

/// Handoff checkpoint emitted by a worker nearing its context limit.
/// A replacement worker is seeded from `state_data` instead of a cold
/// start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub current_step: String,
    #[serde(default)]
    pub state_data: serde_json::Value,
}

/// The durable aggregate for one feature run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub schema_version: u32,
    pub feature: String,
    pub started_at: DateTime<Utc>,
    pub current_level: usize,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub workers: BTreeMap<WorkerId, WorkerRecord>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Reason the run is paused, when it is.
    #[serde(default)]
    pub paused: Option<String>,
}

impl ExecutionState {
    pub fn new(feature: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            feature: feature.to_string(),
            started_at: Utc::now(),
            current_level: 0,
            tasks: BTreeMap::new(),
            workers: BTreeMap::new(),
            checkpoints: Vec::new(),
            paused: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Ids of tasks not yet complete (resume recomputes ready work from
    /// these).
    pub fn incomplete_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, record)| !matches!(record.status, TaskStatus::Complete))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The latest checkpoint for a task, if one exists.
    pub fn latest_checkpoint(&self, task_id: &TaskId) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| &c.task_id == task_id)
    }
}

pub struct StatePersistence;

impl StatePersistence {
    /// Atomically write the state document to `path`.
    pub fn save(state: &ExecutionState, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                Error::Validation(format!("state path {} has no parent directory", path.display()))
            })?;
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(state)?;
        // Temp file in the destination directory so the rename cannot
        // cross filesystems.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        flog_debug!("state saved to {}", path.display());
        Ok(())
    }

    /// Load and validate a state document. Schema violations raise
    /// `StateCorruption` rather than coercing.
    pub fn load(path: &Path) -> Result<ExecutionState> {
        let bytes = std::fs::read(path)?;
        let state: ExecutionState = serde_json::from_slice(&bytes)
            .map_err(|e| Error::StateCorruption(format!("{}: {}", path.display(), e)))?;
        Self::validate(&state)?;
        Ok(state)
    }

    fn validate(state: &ExecutionState) -> Result<()> {
        if state.schema_version != SCHEMA_VERSION {
            return Err(Error::StateCorruption(format!(
                "unsupported schema version {} (expected {})",
                state.schema_version, SCHEMA_VERSION
            )));
        }
        if state.feature.is_empty() {
            return Err(Error::StateCorruption("empty feature name".to_string()));
        }
        for (id, record) in &state.tasks {
            // Ids deserialize transparently, so the pattern is enforced
            // here.
            TaskId::parse(id.as_str())
                .map_err(|_| Error::StateCorruption(format!("invalid task id '{}'", id)))?;
            // Completed tasks keep their worker id for merge-order
            // reconstruction after the worker is reconciled away, so
            // the cross-reference only binds while the task runs.
            if matches!(record.status, TaskStatus::Running) {
                if let Some(worker_id) = &record.worker_id {
                    if !state.workers.contains_key(worker_id) {
                        return Err(Error::StateCorruption(format!(
                            "task {} references unknown worker {}",
                            id, worker_id
                        )));
                    }
                }
            }
        }
        for worker in state.workers.values() {
            if let Some(task) = &worker.task {
                if !state.tasks.contains_key(task) {
                    return Err(Error::StateCorruption(format!(
                        "worker references unknown task {}",
                        task
                    )));
                }
            }
        }
        for checkpoint in &state.checkpoints {
            if !state.tasks.contains_key(&checkpoint.task_id) {
                return Err(Error::StateCorruption(format!(
                    "checkpoint references unknown task {}",
                    checkpoint.task_id
                )));
            }
        }
        Ok(())
    }
}
