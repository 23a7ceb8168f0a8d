//! Worker process launchers.
//!
//! The orchestrator talks to worker processes through the
//! `WorkerLauncher` trait: `SubprocessLauncher` runs a real worker
//! binary per task, `NullLauncher` drives the protocol in-process for
//! tests and dry runs. Workers report status over stdout as one JSON
//! object per line; the launcher translates reports into `WorkerEvent`s
//! on the orchestrator's channel.

use crate::error::{Error, Result};
use crate::graph::Task;
use crate::state::Checkpoint;
use crate::worker::pool::WorkerEvent;
use crate::worker::protocol::WorkerState;
use crate::worker::WorkerId;
use crate::{flog_debug, flog_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Everything a launcher needs to start one worker on one task.
pub struct LaunchRequest {
    pub worker_id: WorkerId,
    pub task: Task,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    /// Present when this worker resumes from a handoff checkpoint.
    pub checkpoint: Option<Checkpoint>,
    pub events: mpsc::Sender<WorkerEvent>,
}

/// One line of worker stdout, parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    State { state: WorkerState },
    Heartbeat { context_usage: f64 },
    Checkpoint { checkpoint: Checkpoint },
    Error { message: String },
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for the request. Implementations must deliver all
    /// subsequent status through `request.events`.
    async fn launch(&self, request: LaunchRequest) -> Result<()>;

    /// Forcefully stop a previously launched worker. Unknown ids are
    /// ignored (the worker may already have exited).
    async fn terminate(&self, worker_id: WorkerId) -> Result<()>;
}

/// Launches the worker binary as a subprocess per task.
pub struct SubprocessLauncher {
    program: String,
    children: Mutex<HashMap<WorkerId, Child>>,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&request.worktree_path)
            .env("FOREMAN_TASK", serde_json::to_string(&request.task)?)
            .env("FOREMAN_TASK_ID", request.task.id.as_str())
            .env("FOREMAN_BRANCH", &request.branch_name)
            .env("FOREMAN_WORKER_ID", request.worker_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(checkpoint) = &request.checkpoint {
            cmd.env("FOREMAN_CHECKPOINT", serde_json::to_string(checkpoint)?);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Launcher(format!("spawn {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Launcher("worker stdout not captured".to_string()))?;

        let worker_id = request.worker_id;
        let events = request.events;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let report: WorkerReport = match serde_json::from_str(&line) {
                            Ok(report) => report,
                            Err(_) => {
                                flog_debug!("worker {} non-report output: {}", worker_id.short(), line);
                                continue;
                            }
                        };
                        let event = match report {
                            WorkerReport::State { state } => {
                                WorkerEvent::StateReported { worker_id, state }
                            }
                            WorkerReport::Heartbeat { context_usage } => {
                                WorkerEvent::Heartbeat {
                                    worker_id,
                                    context_usage,
                                }
                            }
                            WorkerReport::Checkpoint { checkpoint } => {
                                WorkerEvent::Checkpointed {
                                    worker_id,
                                    checkpoint: Box::new(checkpoint),
                                }
                            }
                            WorkerReport::Error { message } => WorkerEvent::Errored {
                                worker_id,
                                message,
                            },
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        flog_warn!("worker {} stdout read failed: {}", worker_id.short(), e);
                        break;
                    }
                }
            }
            let _ = events.send(WorkerEvent::Exited { worker_id }).await;
        });

        self.children
            .lock()
            .map_err(|_| Error::Launcher("launcher child table poisoned".to_string()))?
            .insert(worker_id, child);
        Ok(())
    }

    async fn terminate(&self, worker_id: WorkerId) -> Result<()> {
        let child = self
            .children
            .lock()
            .map_err(|_| Error::Launcher("launcher child table poisoned".to_string()))?
            .remove(&worker_id);
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                flog_warn!("kill worker {}: {}", worker_id.short(), e);
            }
        }
        Ok(())
    }
}

/// Scripted outcome for one task under the null launcher.
#[derive(Debug, Clone)]
pub enum NullOutcome {
    /// Walk the full happy path and report `Complete`.
    Complete,
    /// Walk to `Verifying` then report `Failed` with the message.
    Fail(String),
    /// Report `Executing` then go silent (for stall-detection tests).
    Hang,
    /// Report `Executing`, post a checkpoint, then report `Waiting` as
    /// a worker out of context would. Plays once: the replacement
    /// worker for the task completes.
    Handoff,
}

/// In-process launcher that plays back scripted protocol transitions.
///
/// Tasks with no script entry complete successfully.
pub struct NullLauncher {
    script: Mutex<HashMap<String, NullOutcome>>,
    launched: Mutex<Vec<(WorkerId, String)>>,
    resumed: Mutex<Vec<(String, String)>>,
}

impl NullLauncher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, task_id: &str, outcome: NullOutcome) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.insert(task_id.to_string(), outcome);
        }
        self
    }

    /// (worker, task-id) pairs in launch order.
    pub fn launches(&self) -> Vec<(WorkerId, String)> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// (task-id, checkpoint step) for every launch that carried a
    /// checkpoint, in launch order.
    pub fn resumes(&self) -> Vec<(String, String)> {
        self.resumed.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Default for NullLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for NullLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<()> {
        let task_id = request.task.id.to_string();
        let outcome = match self.script.lock() {
            Ok(mut script) => match script.get(&task_id).cloned() {
                Some(NullOutcome::Handoff) => {
                    script.insert(task_id.clone(), NullOutcome::Complete);
                    NullOutcome::Handoff
                }
                Some(outcome) => outcome,
                None => NullOutcome::Complete,
            },
            Err(_) => NullOutcome::Complete,
        };
        if let Ok(mut launched) = self.launched.lock() {
            launched.push((request.worker_id, task_id.clone()));
        }
        if let Some(checkpoint) = &request.checkpoint {
            if let Ok(mut resumed) = self.resumed.lock() {
                resumed.push((task_id.clone(), checkpoint.current_step.clone()));
            }
        }

        let worker_id = request.worker_id;
        let task = request.task;
        let events = request.events;
        tokio::spawn(async move {
            let report = |state| WorkerEvent::StateReported { worker_id, state };
            match outcome {
                NullOutcome::Complete => {
                    for state in [
                        WorkerState::Executing,
                        WorkerState::Verifying,
                        WorkerState::SelfReview,
                        WorkerState::Complete,
                    ] {
                        if events.send(report(state)).await.is_err() {
                            return;
                        }
                    }
                    let _ = events.send(WorkerEvent::Exited { worker_id }).await;
                }
                NullOutcome::Fail(message) => {
                    for state in [WorkerState::Executing, WorkerState::Verifying] {
                        if events.send(report(state)).await.is_err() {
                            return;
                        }
                    }
                    let _ = events
                        .send(WorkerEvent::Errored { worker_id, message })
                        .await;
                    let _ = events.send(report(WorkerState::Failed)).await;
                    let _ = events.send(WorkerEvent::Exited { worker_id }).await;
                }
                NullOutcome::Hang => {
                    let _ = events.send(report(WorkerState::Executing)).await;
                }
                NullOutcome::Handoff => {
                    if events.send(report(WorkerState::Executing)).await.is_err() {
                        return;
                    }
                    let checkpoint = Checkpoint {
                        task_id: task.id.clone(),
                        worker_id,
                        timestamp: chrono::Utc::now(),
                        files_created: vec![],
                        files_modified: vec![],
                        current_step: "midway".to_string(),
                        state_data: serde_json::json!({"handoff": true}),
                    };
                    let _ = events
                        .send(WorkerEvent::Checkpointed {
                            worker_id,
                            checkpoint: Box::new(checkpoint),
                        })
                        .await;
                    let _ = events.send(report(WorkerState::Waiting)).await;
                    let _ = events.send(WorkerEvent::Exited { worker_id }).await;
                }
            }
        });
        Ok(())
    }

    async fn terminate(&self, _worker_id: WorkerId) -> Result<()> {
        Ok(())
    }
}
