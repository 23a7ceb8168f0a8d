//! The level-barrier orchestration loop.
//!
//! One coordinating task drives the run: it assigns ready tasks to
//! worker slots, reacts to worker reports from the event channel,
//! polls for stalls and stop requests, and holds a hard barrier
//! between levels. Level N's merge is fully committed (gates passed,
//! staging promoted) before any level N+1 task is assigned. The
//! orchestrator is the only writer of the execution state file.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{TaskGraph, TaskId, TaskStatus};
use crate::resilience::{BackpressureController, CircuitBreaker, RetryPolicy};
use crate::state::{Checkpoint, ExecutionState, StatePersistence, TaskRecord, WorkerRecord};
use crate::worker::{LaunchRequest, WorkerEvent, WorkerId, WorkerLauncher, WorkerPool, WorkerState};
use crate::worktree::{MergeOutcome, WorktreeManager};
use crate::{flog, flog_debug, flog_error, flog_warn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of the quality gate run against merged staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Fail(String),
    Timeout,
    Error(String),
}

/// Runs quality checks against the merged staging state before it is
/// promoted to the feature branch. Embedders supply their own; the CLI
/// uses `CommandGate`.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn run(&self, repo_path: &Path) -> GateOutcome;
}

/// Runs a shell command in the repository; exit status maps to the
/// gate outcome. No command configured means the gate always passes.
pub struct CommandGate {
    command: Option<String>,
    timeout: Duration,
}

impl CommandGate {
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl QualityGate for CommandGate {
    async fn run(&self, repo_path: &Path) -> GateOutcome {
        let Some(command) = &self.command else {
            return GateOutcome::Pass;
        };
        flog_debug!("CommandGate: running '{}'", command);
        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(repo_path)
                .output(),
        )
        .await;
        match result {
            Err(_) => GateOutcome::Timeout,
            Ok(Err(e)) => GateOutcome::Error(e.to_string()),
            Ok(Ok(output)) => {
                if output.status.success() {
                    GateOutcome::Pass
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail: String = stderr
                        .lines()
                        .rev()
                        .take(5)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect::<Vec<_>>()
                        .join("\n");
                    GateOutcome::Fail(format!("exit {}: {}", output.status, tail))
                }
            }
        }
    }
}

/// Observable milestones, mirrored to the log and to an optional
/// subscriber channel.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    LevelStarted { level: usize },
    TaskAssigned { task: TaskId, worker: WorkerId },
    TaskCompleted { task: TaskId },
    TaskRetryScheduled { task: TaskId, attempt: u32, delay_ms: i64 },
    TaskBlocked { task: TaskId, reason: String },
    CheckpointRecorded { task: TaskId, worker: WorkerId },
    LevelMerged { level: usize },
    MergeConflict { worker: WorkerId, paths: Vec<String> },
    GateFailed { reason: String },
    LevelPromoted { level: usize },
    Paused { reason: String },
    RunComplete,
    Stopped { forced: bool },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every level merged, gated, and promoted.
    Complete,
    /// Fail-closed pause; state is persisted and resumable.
    Paused(String),
    /// Stop requested; state is persisted and resumable.
    Stopped,
}

/// What `retry` applies to.
#[derive(Debug, Clone)]
pub enum RetryTarget {
    Task(TaskId),
    Level(usize),
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub level: usize,
    pub status: String,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
pub struct WorkerSummary {
    pub id: String,
    pub state: String,
    pub task: Option<String>,
    pub context_usage: f64,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub feature: String,
    pub run_state: String,
    pub current_level: usize,
    pub level_count: usize,
    pub complete: usize,
    pub blocked: usize,
    pub tasks: Vec<TaskSummary>,
    pub workers: Vec<WorkerSummary>,
}

enum LevelOutcome {
    Promoted,
    Paused(String),
    Stopped { forced: bool },
}

pub struct Orchestrator {
    config: Config,
    graph: TaskGraph,
    pool: WorkerPool,
    worktree: WorktreeManager,
    launcher: Arc<dyn WorkerLauncher>,
    gate: Box<dyn QualityGate>,
    state: ExecutionState,
    state_path: PathBuf,
    repo_path: PathBuf,
    feature: String,
    staging_branch: String,
    feature_branch: String,
    retry_policy: RetryPolicy,
    breaker: CircuitBreaker,
    backpressure: BackpressureController,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
    kill: CancellationToken,
    subscriber: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    /// Earliest next-assignment time for tasks awaiting a retry.
    retry_after: HashMap<TaskId, DateTime<Utc>>,
}

impl Orchestrator {
    /// Start a fresh run. Creates the staging branch
    /// `{feature}/staging` from `base_branch`; workers branch from
    /// staging so each level sees the previous level's merged work.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        graph: TaskGraph,
        repo_path: &Path,
        base_branch: &str,
        feature: &str,
        state_path: &Path,
        launcher: Arc<dyn WorkerLauncher>,
        gate: Box<dyn QualityGate>,
    ) -> Result<Self> {
        let state = ExecutionState::new(feature);
        Self::build(
            config, graph, repo_path, base_branch, feature, state_path, launcher, gate, state,
        )
    }

    /// Resume from a persisted state file. Tasks that were running when
    /// the previous process died are requeued as pending (their worker
    /// processes do not survive a restart); completed work and attempt
    /// counts carry over. An explicit resume clears any pause.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        config: Config,
        graph: TaskGraph,
        repo_path: &Path,
        base_branch: &str,
        feature: &str,
        state_path: &Path,
        launcher: Arc<dyn WorkerLauncher>,
        gate: Box<dyn QualityGate>,
    ) -> Result<Self> {
        let mut state = StatePersistence::load(state_path)?;
        if state.feature != feature {
            return Err(Error::StateCorruption(format!(
                "state file is for feature '{}', not '{}'",
                state.feature, feature
            )));
        }
        state.workers.clear();
        state.paused = None;

        let mut orchestrator = Self::build(
            config, graph, repo_path, base_branch, feature, state_path, launcher, gate, state,
        )?;
        orchestrator.overlay_state()?;
        orchestrator.worktree.prune_stale()?;
        Ok(orchestrator)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        config: Config,
        graph: TaskGraph,
        repo_path: &Path,
        base_branch: &str,
        feature: &str,
        state_path: &Path,
        launcher: Arc<dyn WorkerLauncher>,
        gate: Box<dyn QualityGate>,
        state: ExecutionState,
    ) -> Result<Self> {
        let worktrees_dir = config.worktrees_dir()?;
        let worktree = WorktreeManager::new(repo_path, &worktrees_dir, feature)?;
        // A ref named `{feature}` cannot coexist with `{feature}/...`
        // children, so the promoted branch lives inside the namespace.
        let staging_branch = format!("{}/staging", feature);
        let feature_branch = format!("{}/main", feature);
        worktree.ensure_branch(&staging_branch, base_branch)?;

        let (events_tx, events_rx) = mpsc::channel(256);
        Ok(Self {
            pool: WorkerPool::new(config.max_concurrent, config.max_revisions),
            retry_policy: RetryPolicy::new(&config.backoff),
            breaker: CircuitBreaker::new(&config.circuit),
            backpressure: BackpressureController::new(&config.backpressure),
            config,
            graph,
            worktree,
            launcher,
            gate,
            state,
            state_path: state_path.to_path_buf(),
            repo_path: repo_path.to_path_buf(),
            feature: feature.to_string(),
            staging_branch,
            feature_branch,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            kill: CancellationToken::new(),
            subscriber: None,
            retry_after: HashMap::new(),
        })
    }

    /// Token for a graceful stop: no new assignments, in-flight workers
    /// finish their current step, state is persisted.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token for a forced stop: workers are killed immediately; the run
    /// resumes from the last persisted snapshot.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Subscribe to orchestrator events (tests and embedders).
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    /// Overlay persisted task records onto the freshly built graph.
    fn overlay_state(&mut self) -> Result<()> {
        let records: Vec<(TaskId, TaskRecord)> = self
            .state
            .tasks
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        for (id, record) in records {
            let Some(task) = self.graph.get_mut(&id) else {
                return Err(Error::StateCorruption(format!(
                    "state file references task {} not present in the graph",
                    id
                )));
            };
            task.status = record.status;
            task.worker_id = record.worker_id;
            task.started_at = record.started_at;
            task.completed_at = record.completed_at;
            task.attempts = record.attempts;
            if matches!(task.status, TaskStatus::Running) {
                flog!("resume: requeueing {} (worker gone)", id);
                task.reset_for_retry(false);
            }
        }
        Ok(())
    }

    /// Drive the run to completion, pause, or stop.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.config.ensure_dirs()?;
        self.persist()?;

        while self.state.current_level < self.graph.level_count() {
            let level = self.state.current_level;
            self.emit(OrchestratorEvent::LevelStarted { level });
            match self.run_level(level).await? {
                LevelOutcome::Promoted => {
                    self.state.current_level += 1;
                    self.retry_after.clear();
                    self.persist()?;
                }
                LevelOutcome::Paused(reason) => {
                    return Ok(RunOutcome::Paused(reason));
                }
                LevelOutcome::Stopped { forced } => {
                    self.emit(OrchestratorEvent::Stopped { forced });
                    return Ok(RunOutcome::Stopped);
                }
            }
        }

        self.emit(OrchestratorEvent::RunComplete);
        self.persist()?;
        Ok(RunOutcome::Complete)
    }

    async fn run_level(&mut self, level: usize) -> Result<LevelOutcome> {
        loop {
            // Barrier check first so resumed runs with finished levels
            // fall straight through to merge.
            let (empty, all_settled, all_complete, blocked) = {
                let tasks = self.graph.level_tasks(level);
                (
                    tasks.is_empty(),
                    tasks.iter().all(|t| t.is_settled()),
                    tasks.iter().all(|t| t.is_complete()),
                    tasks
                        .iter()
                        .filter(|t| t.is_blocked())
                        .map(|t| format!("{} ({})", t.id, t.status))
                        .collect::<Vec<String>>(),
                )
            };
            if empty {
                // An empty level cannot occur in a validated graph, but
                // advancing keeps the loop total.
                return Ok(LevelOutcome::Promoted);
            }
            if all_settled {
                if all_complete {
                    return self.integrate_level(level).await;
                }
                let reason =
                    format!("level {} has blocked tasks: {}", level, blocked.join(", "));
                self.pause(&reason)?;
                return Ok(LevelOutcome::Paused(reason));
            }

            self.assign_ready(level).await?;

            tokio::select! {
                _ = self.kill.cancelled() => {
                    return self.shutdown(true).await;
                }
                _ = self.cancel.cancelled() => {
                    return self.shutdown(false).await;
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await?;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {
                    self.tick().await?;
                }
            }
        }
    }

    /// Assign ready tasks to free slots, subject to the three guards.
    async fn assign_ready(&mut self, level: usize) -> Result<()> {
        let now = Utc::now();
        let effective = self
            .backpressure
            .effective_concurrency(self.config.max_concurrent);

        let candidates: Vec<TaskId> = self
            .graph
            .level_tasks(level)
            .iter()
            .filter(|t| t.is_assignable())
            .filter(|t| {
                self.retry_after
                    .get(&t.id)
                    .map(|at| now >= *at)
                    .unwrap_or(true)
            })
            .map(|t| t.id.clone())
            .collect();

        for task_id in candidates {
            if !self.pool.has_capacity(effective) {
                flog_debug!("assign deferred: no capacity (effective={})", effective);
                break;
            }
            if !self.breaker.allow(now) {
                flog_debug!("assign deferred: circuit open");
                break;
            }
            match self.spawn_worker(&task_id).await {
                Ok(worker_id) => {
                    self.breaker.record_success();
                    self.retry_after.remove(&task_id);
                    self.emit(OrchestratorEvent::TaskAssigned {
                        task: task_id,
                        worker: worker_id,
                    });
                    self.persist()?;
                }
                Err(e) => {
                    flog_warn!("spawn for {} failed: {}", task_id, e);
                    self.breaker.record_failure(now);
                    self.schedule_retry_or_block(&task_id, &format!("spawn failed: {}", e))?;
                }
            }
        }
        Ok(())
    }

    /// Create the worktree, admit the worker, and launch it. The attempt
    /// is charged before any setup, so a spawn that dies in worktree or
    /// pool setup counts against the task the same as a failed worker.
    /// On failure the slot and worktree are released; the consumed
    /// attempt stands.
    async fn spawn_worker(&mut self, task_id: &TaskId) -> Result<WorkerId> {
        let worker_id = WorkerId::new();
        let snapshot = {
            let task = self
                .graph
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
            task.start(worker_id);
            task.clone()
        };
        let checkpoint = self.state.latest_checkpoint(task_id).cloned();

        let (path, branch) = self.worktree.create(worker_id, &self.staging_branch)?;
        if let Err(e) = self
            .pool
            .admit(worker_id, task_id.clone(), path.clone(), branch.clone())
        {
            let _ = self.worktree.cleanup(worker_id, true);
            return Err(e);
        }

        let request = LaunchRequest {
            worker_id,
            task: snapshot,
            worktree_path: path,
            branch_name: branch,
            checkpoint,
            events: self.events_tx.clone(),
        };
        if let Err(e) = self.launcher.launch(request).await {
            self.pool.remove(&worker_id);
            let _ = self.worktree.cleanup(worker_id, true);
            if let Some(task) = self.graph.get_mut(task_id) {
                task.worker_id = None;
            }
            return Err(e);
        }
        flog!("assigned {} to worker {}", task_id, worker_id.short());
        Ok(worker_id)
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Heartbeat {
                worker_id,
                context_usage,
            } => {
                if self.pool.get(&worker_id).is_some() {
                    self.pool.heartbeat(&worker_id, context_usage)?;
                    if context_usage >= self.config.checkpoint_threshold {
                        flog_debug!(
                            "worker {} context at {:.0}%, expecting checkpoint handoff",
                            worker_id.short(),
                            context_usage * 100.0
                        );
                    }
                }
            }
            WorkerEvent::Errored { worker_id, message } => {
                flog_warn!("worker {} error: {}", worker_id.short(), message);
                if let Some(worker) = self.pool.get_mut(&worker_id) {
                    worker.last_error = Some(message);
                }
            }
            WorkerEvent::Checkpointed {
                worker_id,
                checkpoint,
            } => {
                self.record_checkpoint(worker_id, *checkpoint)?;
            }
            WorkerEvent::StateReported { worker_id, state } => {
                self.handle_state_report(worker_id, state).await?;
            }
            WorkerEvent::Exited { worker_id } => {
                // Terminal states reconcile the worker before the exit
                // event lands; anything still in the pool died mid-task.
                if self.pool.get(&worker_id).is_some() {
                    self.reconcile_failure(worker_id, "worker process exited unexpectedly")
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_state_report(&mut self, worker_id: WorkerId, state: WorkerState) -> Result<()> {
        if self.pool.get(&worker_id).is_none() {
            flog_debug!(
                "ignoring report from reconciled worker {}",
                worker_id.short()
            );
            return Ok(());
        }
        if !self.pool.apply_state(&worker_id, state)? {
            let from = self
                .pool
                .get(&worker_id)
                .map(|w| w.state().to_string())
                .unwrap_or_default();
            flog_warn!(
                "worker {} protocol violation: {} -> {}",
                worker_id.short(),
                from,
                state
            );
            self.reconcile_failure(
                worker_id,
                &Error::ProtocolViolation {
                    from,
                    to: state.to_string(),
                }
                .to_string(),
            )
            .await?;
            return Ok(());
        }

        match state {
            WorkerState::Complete => self.reconcile_success(worker_id).await?,
            WorkerState::Failed => {
                let error = self
                    .pool
                    .get(&worker_id)
                    .and_then(|w| w.last_error.clone())
                    .unwrap_or_else(|| "worker reported failure".to_string());
                self.reconcile_failure(worker_id, &error).await?;
            }
            WorkerState::Waiting => self.reconcile_handoff(worker_id).await?,
            _ => self.persist()?,
        }
        Ok(())
    }

    /// A worker finished and verified its task. The worktree must be
    /// clean: uncommitted work would silently vanish at merge time, so
    /// a dirty tree fails the attempt instead.
    async fn reconcile_success(&mut self, worker_id: WorkerId) -> Result<()> {
        if self.worktree.is_dirty(worker_id).unwrap_or(false) {
            self.reconcile_failure(worker_id, "worktree left with uncommitted changes")
                .await?;
            return Ok(());
        }
        let Some(worker) = self.pool.remove(&worker_id) else {
            return Ok(());
        };
        // Branch is kept for the level merge; only the directory goes.
        let _ = self.worktree.cleanup(worker_id, false);
        if let Some(task_id) = worker.task {
            if let Some(task) = self.graph.get_mut(&task_id) {
                task.complete();
                flog!("task {} complete (worker {})", task_id, worker_id.short());
            }
            self.backpressure.record(true);
            self.emit(OrchestratorEvent::TaskCompleted { task: task_id });
        }
        self.persist()
    }

    /// A worker (or its spawn) failed. Consumes the attempt already
    /// counted at start; schedules a retry or blocks the task.
    async fn reconcile_failure(&mut self, worker_id: WorkerId, error: &str) -> Result<()> {
        let Some(worker) = self.pool.remove(&worker_id) else {
            return Ok(());
        };
        let _ = self.launcher.terminate(worker_id).await;
        // Failed work is discarded, branch included.
        let _ = self.worktree.cleanup(worker_id, true);
        self.backpressure.record(false);
        if let Some(task_id) = worker.task {
            flog_warn!(
                "task {} failed on worker {}: {}",
                task_id,
                worker_id.short(),
                error
            );
            self.schedule_retry_or_block(&task_id, error)?;
        }
        self.persist()
    }

    /// A worker checkpointed out near its context limit. The task is
    /// requeued; the next assignment seeds a fresh worker from the
    /// recorded checkpoint. Handoff is not a failure, so the attempt
    /// is refunded.
    async fn reconcile_handoff(&mut self, worker_id: WorkerId) -> Result<()> {
        let Some(worker) = self.pool.remove(&worker_id) else {
            return Ok(());
        };
        let _ = self.launcher.terminate(worker_id).await;
        let _ = self.worktree.cleanup(worker_id, true);
        if let Some(task_id) = worker.task {
            if let Some(task) = self.graph.get_mut(&task_id) {
                task.reset_for_retry(false);
                task.attempts = task.attempts.saturating_sub(1);
                flog!(
                    "task {} handed off by worker {} at {:.0}% context",
                    task_id,
                    worker_id.short(),
                    worker.context_usage * 100.0
                );
            }
        }
        self.persist()
    }

    fn record_checkpoint(&mut self, worker_id: WorkerId, checkpoint: Checkpoint) -> Result<()> {
        let task = checkpoint.task_id.clone();
        self.state.checkpoints.push(checkpoint);
        self.emit(OrchestratorEvent::CheckpointRecorded {
            task,
            worker: worker_id,
        });
        self.persist()
    }

    /// Convert a consumed failed attempt into either a delayed retry or
    /// a blocked task.
    fn schedule_retry_or_block(&mut self, task_id: &TaskId, error: &str) -> Result<()> {
        let max_attempts = 1 + self.config.retry_attempts;
        let Some(task) = self.graph.get_mut(task_id) else {
            return Err(Error::TaskNotFound(task_id.to_string()));
        };
        task.fail(error);
        if task.attempts >= max_attempts {
            let reason = format!("{} attempts exhausted; last error: {}", task.attempts, error);
            task.block(&reason);
            self.emit(OrchestratorEvent::TaskBlocked {
                task: task_id.clone(),
                reason,
            });
        } else {
            let attempt = task.attempts;
            task.reset_for_retry(false);
            let delay = self.retry_policy.delay(attempt);
            self.retry_after.insert(task_id.clone(), Utc::now() + delay);
            self.emit(OrchestratorEvent::TaskRetryScheduled {
                task: task_id.clone(),
                attempt,
                delay_ms: delay.num_milliseconds(),
            });
        }
        Ok(())
    }

    /// Periodic housekeeping: stall detection and stop-request files.
    async fn tick(&mut self) -> Result<()> {
        let now = Utc::now();
        for worker_id in self.pool.stalled(now, self.config.stall_timeout()) {
            flog_warn!("worker {} stalled, reclaiming", worker_id.short());
            self.reconcile_failure(worker_id, "worker silent past stall timeout")
                .await?;
        }

        // `foreman stop` coordinates through a sibling marker file.
        let stop_path = self.stop_request_path();
        if stop_path.exists() {
            let force = std::fs::read_to_string(&stop_path)
                .map(|s| s.trim() == "force")
                .unwrap_or(false);
            let _ = std::fs::remove_file(&stop_path);
            flog!("stop requested (force={})", force);
            if force {
                self.kill.cancel();
            } else {
                self.cancel.cancel();
            }
        }
        Ok(())
    }

    fn stop_request_path(&self) -> PathBuf {
        self.state_path.with_extension("stop")
    }

    async fn shutdown(&mut self, forced: bool) -> Result<LevelOutcome> {
        if forced {
            flog!("forced stop: killing {} workers", self.pool.len());
            let ids: Vec<WorkerId> = self.pool.iter().map(|w| w.id).collect();
            for worker_id in ids {
                let _ = self.launcher.terminate(worker_id).await;
                if let Some(worker) = self.pool.remove(&worker_id) {
                    let _ = self.worktree.cleanup(worker_id, true);
                    if let Some(task_id) = worker.task {
                        if let Some(task) = self.graph.get_mut(&task_id) {
                            // Killed mid-task; resume requeues without
                            // charging an attempt.
                            task.reset_for_retry(false);
                            task.attempts = task.attempts.saturating_sub(1);
                        }
                    }
                }
            }
            self.persist()?;
            return Ok(LevelOutcome::Stopped { forced: true });
        }

        // Graceful: stop assigning, let in-flight workers finish their
        // current verification or checkpoint, bounded by the stall
        // timeout.
        flog!("graceful stop: draining {} workers", self.pool.len());
        let deadline = tokio::time::Instant::now() + self.config.stall_timeout();
        while !self.pool.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await?,
                Ok(None) => break,
                Err(_) => {
                    flog_warn!("graceful stop timed out with {} workers left", self.pool.len());
                    for worker_id in self.pool.iter().map(|w| w.id).collect::<Vec<_>>() {
                        self.reconcile_failure(worker_id, "terminated during graceful stop")
                            .await?;
                    }
                    break;
                }
            }
        }
        self.persist()?;
        Ok(LevelOutcome::Stopped { forced: false })
    }

    /// Merge the level's worker branches, run the gate, promote.
    async fn integrate_level(&mut self, level: usize) -> Result<LevelOutcome> {
        let workers: Vec<(WorkerId, String)> = self
            .graph
            .level_tasks(level)
            .iter()
            .filter_map(|t| t.worker_id)
            .map(|id| (id, self.worktree.branch_name(id)))
            .collect();
        flog!("level {}: merging {} worker branches", level, workers.len());

        match self.worktree.merge_level(&workers, &self.staging_branch)? {
            MergeOutcome::Conflict { worker_id, paths } => {
                self.emit(OrchestratorEvent::MergeConflict {
                    worker: worker_id,
                    paths: paths.clone(),
                });
                let reason = Error::MergeConflict {
                    worker_id: worker_id.short(),
                    paths,
                }
                .to_string();
                self.pause(&reason)?;
                Ok(LevelOutcome::Paused(reason))
            }
            MergeOutcome::Merged { commits } => {
                flog_debug!("level {}: {} merge commits", level, commits.len());
                self.emit(OrchestratorEvent::LevelMerged { level });
                match self.gate.run(&self.repo_path).await {
                    GateOutcome::Pass => {
                        self.worktree
                            .promote(&self.staging_branch, &self.feature_branch)?;
                        self.emit(OrchestratorEvent::LevelPromoted { level });
                        Ok(LevelOutcome::Promoted)
                    }
                    outcome => {
                        let reason = match outcome {
                            GateOutcome::Fail(msg) => format!("quality gate failed: {}", msg),
                            GateOutcome::Timeout => "quality gate timed out".to_string(),
                            GateOutcome::Error(msg) => format!("quality gate error: {}", msg),
                            GateOutcome::Pass => unreachable!(),
                        };
                        self.emit(OrchestratorEvent::GateFailed {
                            reason: reason.clone(),
                        });
                        self.pause(&reason)?;
                        Ok(LevelOutcome::Paused(reason))
                    }
                }
            }
        }
    }

    fn pause(&mut self, reason: &str) -> Result<()> {
        flog_error!("run paused: {}", reason);
        self.state.paused = Some(reason.to_string());
        self.emit(OrchestratorEvent::Paused {
            reason: reason.to_string(),
        });
        self.persist()
    }

    /// Clear blocked/failed status for a task or a whole level and
    /// unpause the run. `force` also resets attempt counters.
    pub fn retry(&mut self, target: RetryTarget, force: bool) -> Result<()> {
        let ids: Vec<TaskId> = match &target {
            RetryTarget::Task(id) => {
                if self.graph.get(id).is_none() {
                    return Err(Error::TaskNotFound(id.to_string()));
                }
                vec![id.clone()]
            }
            RetryTarget::Level(level) => self
                .graph
                .level_tasks(*level)
                .iter()
                .map(|t| t.id.clone())
                .collect(),
        };
        let mut reset = 0;
        for id in ids {
            if let Some(task) = self.graph.get_mut(&id) {
                if matches!(
                    task.status,
                    TaskStatus::Blocked { .. } | TaskStatus::Failed { .. }
                ) {
                    task.reset_for_retry(force);
                    self.retry_after.remove(&id);
                    reset += 1;
                    flog!("retry: requeued {} (force={})", id, force);
                }
            }
        }
        if reset == 0 {
            flog_warn!("retry: nothing to requeue for {:?}", target);
        }
        self.state.paused = None;
        self.persist()
    }

    pub fn status(&self) -> StatusReport {
        let tasks: Vec<TaskSummary> = self
            .graph
            .all_tasks()
            .map(|t| TaskSummary {
                id: t.id.to_string(),
                title: t.title.clone(),
                level: t.level,
                status: t.status.to_string(),
                attempts: t.attempts,
            })
            .collect();
        let workers: Vec<WorkerSummary> = self
            .pool
            .iter()
            .map(|w| WorkerSummary {
                id: w.id.short(),
                state: w.state().to_string(),
                task: w.task.as_ref().map(|t| t.to_string()),
                context_usage: w.context_usage,
            })
            .collect();
        let complete = tasks.iter().filter(|t| t.status == "complete").count();
        let blocked = tasks.iter().filter(|t| t.status.starts_with("blocked")).count();
        let run_state = if let Some(reason) = &self.state.paused {
            format!("paused: {}", reason)
        } else if self.state.current_level >= self.graph.level_count() {
            "complete".to_string()
        } else {
            "running".to_string()
        };
        StatusReport {
            feature: self.feature.clone(),
            run_state,
            current_level: self.state.current_level,
            level_count: self.graph.level_count(),
            complete,
            blocked,
            tasks,
            workers,
        }
    }

    /// Snapshot graph and pool into the state document and write it
    /// atomically. Called after every state-affecting event.
    fn persist(&mut self) -> Result<()> {
        self.state.tasks = self
            .graph
            .all_tasks()
            .map(|t| (t.id.clone(), TaskRecord::from(t)))
            .collect();
        self.state.workers = self
            .pool
            .iter()
            .map(|w| (w.id, WorkerRecord::from(w)))
            .collect();
        StatePersistence::save(&self.state, &self.state_path)
    }

    fn emit(&self, event: OrchestratorEvent) {
        flog_debug!("event: {:?}", event);
        if let Some(subscriber) = &self.subscriber {
            let _ = subscriber.send(event);
        }
    }
}

/// Write a stop request for a running orchestrator watching
/// `state_path`.
pub fn request_stop(state_path: &Path, force: bool) -> Result<()> {
    let path = state_path.with_extension("stop");
    std::fs::write(&path, if force { "force" } else { "graceful" })?;
    Ok(())
}
