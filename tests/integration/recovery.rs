//! Crash safety, resume, and retry exhaustion.

use std::process::Command;
use std::sync::Arc;

use chrono::Utc;
use foreman::orchestrator::{RetryTarget, RunOutcome};
use foreman::state::{ExecutionState, StatePersistence, TaskRecord, WorkerRecord};
use foreman::worker::{NullLauncher, NullOutcome, WorkerId, WorkerState};
use foreman::{TaskId, TaskStatus};
use tempfile::TempDir;

use crate::fixtures::{
    build_graph, git, orchestrator, resume_orchestrator, state_path, test_config, TestRepo,
};

fn tid(s: &str) -> TaskId {
    TaskId::parse(s).unwrap()
}

/// Child-process body for the kill test below. Saves in a tight loop
/// until killed; a no-op in a normal test run.
#[test]
fn save_crash_writer() {
    let Some(dir) = std::env::var_os("FOREMAN_CRASH_SAVE_DIR") else {
        return;
    };
    let path = std::path::Path::new(&dir).join("auth.state.json");
    let mut state = ExecutionState::new("auth");
    loop {
        state.current_level = state.current_level.wrapping_add(1);
        StatePersistence::save(&state, &path).unwrap();
    }
}

#[test]
fn killed_mid_save_never_tears_the_state_file() {
    let scratch = TempDir::new().unwrap();
    let path = scratch.path().join("auth.state.json");

    let mut state = ExecutionState::new("auth");
    state.current_level = 1;
    StatePersistence::save(&state, &path).unwrap();

    // Re-run this binary filtered down to the writer loop above and
    // kill it at an arbitrary point. Saves stage through a temp file
    // and land with an atomic rename, so the destination must parse as
    // a complete state no matter where the writer died.
    let exe = std::env::current_exe().unwrap();
    for _ in 0..5 {
        let mut child = Command::new(&exe)
            .args(["recovery::save_crash_writer", "--exact"])
            .env("FOREMAN_CRASH_SAVE_DIR", scratch.path())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(40));
        let _ = child.kill();
        let _ = child.wait();

        let loaded = StatePersistence::load(&path).unwrap();
        assert_eq!(loaded.feature, "auth");
        assert!(loaded.current_level >= 1);
    }
}

#[tokio::test]
async fn spawn_failure_consumes_attempts_and_blocks() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let graph_json = r#"{
        "tasks": [
            {"id": "SPAWN-001", "title": "doomed task", "dependencies": [],
             "files": {"create": ["src/doomed.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}}
        ]
    }"#;

    let launcher = Arc::new(NullLauncher::new());
    let mut orch = orchestrator(
        &repo,
        build_graph(graph_json),
        test_config(scratch.path()),
        "spawn",
        scratch.path(),
        launcher.clone(),
    )
    .unwrap();

    // Knock out the staging base so every worktree creation fails
    // before a worker can launch.
    git(&repo.path, &["branch", "-D", "spawn/staging"]);

    let outcome = orch.run().await.unwrap();
    match outcome {
        RunOutcome::Paused(reason) => assert!(reason.contains("SPAWN-001")),
        other => panic!("expected pause, got {:?}", other),
    }

    let report = orch.status();
    let task = report.tasks.iter().find(|t| t.id == "SPAWN-001").unwrap();
    assert!(task.status.starts_with("blocked"));
    // Both attempts died in setup, and both counted.
    assert_eq!(task.attempts, 2);
    assert!(launcher.launches().is_empty());
}

#[tokio::test]
async fn context_handoff_requeues_and_seeds_the_replacement() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let graph_json = r#"{
        "tasks": [
            {"id": "HAND-001", "title": "long-running task", "dependencies": [],
             "files": {"create": ["src/long.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}}
        ]
    }"#;

    let launcher = Arc::new(NullLauncher::new().script("HAND-001", NullOutcome::Handoff));
    let mut orch = orchestrator(
        &repo,
        build_graph(graph_json),
        test_config(scratch.path()),
        "hand",
        scratch.path(),
        launcher.clone(),
    )
    .unwrap();
    assert_eq!(orch.run().await.unwrap(), RunOutcome::Complete);

    // The first worker checkpointed out; a replacement finished the
    // task seeded from the recorded checkpoint.
    assert_eq!(launcher.launches().len(), 2);
    assert_eq!(
        launcher.resumes(),
        vec![("HAND-001".to_string(), "midway".to_string())]
    );

    let report = orch.status();
    let task = report.tasks.iter().find(|t| t.id == "HAND-001").unwrap();
    assert_eq!(task.status, "complete");
    // The handoff refunded its attempt; only the finishing one counts.
    assert_eq!(task.attempts, 1);

    let state = StatePersistence::load(&state_path(scratch.path(), "hand")).unwrap();
    assert_eq!(state.checkpoints.len(), 1);
    assert_eq!(state.checkpoints[0].task_id, tid("HAND-001"));
}

#[tokio::test]
async fn resume_requeues_tasks_whose_workers_are_gone() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let graph_json = r#"{
        "tasks": [
            {"id": "AUTH-001", "title": "model", "dependencies": [],
             "files": {"create": ["src/model.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}},
            {"id": "AUTH-002", "title": "endpoint", "dependencies": ["AUTH-001"],
             "files": {"create": ["src/endpoint.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}}
        ]
    }"#;

    // Persisted state from a run that died while AUTH-001 was running.
    let dead_worker = WorkerId::new();
    let mut state = ExecutionState::new("auth");
    state.tasks.insert(
        tid("AUTH-001"),
        TaskRecord {
            status: TaskStatus::Running,
            worker_id: Some(dead_worker),
            started_at: Some(Utc::now()),
            completed_at: None,
            attempts: 1,
        },
    );
    state.tasks.insert(
        tid("AUTH-002"),
        TaskRecord {
            status: TaskStatus::Pending,
            worker_id: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
        },
    );
    state.workers.insert(
        dead_worker,
        WorkerRecord {
            state: WorkerState::Executing,
            task: Some(tid("AUTH-001")),
            branch_name: "auth/worker-dead0000".to_string(),
            worktree_path: "/nonexistent".to_string(),
            context_usage: 0.2,
            last_heartbeat: Utc::now(),
        },
    );
    StatePersistence::save(&state, &state_path(scratch.path(), "auth")).unwrap();

    let launcher = Arc::new(NullLauncher::new());
    let mut orch = resume_orchestrator(
        &repo,
        build_graph(graph_json),
        test_config(scratch.path()),
        "auth",
        scratch.path(),
        launcher.clone(),
    )
    .unwrap();

    // The interrupted task is pending again with its attempt preserved.
    let report = orch.status();
    let auth1 = report.tasks.iter().find(|t| t.id == "AUTH-001").unwrap();
    assert_eq!(auth1.status, "pending");
    assert_eq!(auth1.attempts, 1);

    assert_eq!(orch.run().await.unwrap(), RunOutcome::Complete);
    assert_eq!(launcher.launches().len(), 2);
}

#[tokio::test]
async fn retry_exhaustion_blocks_task_and_pauses_level() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let graph_json = r#"{
        "tasks": [
            {"id": "PAY-001", "title": "charge flow", "dependencies": [],
             "files": {"create": ["src/charge.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}},
            {"id": "PAY-002", "title": "refund flow", "dependencies": [],
             "files": {"create": ["src/refund.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}},
            {"id": "PAY-003", "title": "reporting", "dependencies": ["PAY-001", "PAY-002"],
             "files": {"create": ["src/report.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}}
        ]
    }"#;

    let launcher = Arc::new(
        NullLauncher::new().script("PAY-001", NullOutcome::Fail("verification exit 1".into())),
    );
    // retry_attempts = 1: initial attempt plus one retry, then blocked.
    let config = test_config(scratch.path());
    let mut orch = orchestrator(
        &repo,
        build_graph(graph_json),
        config,
        "pay",
        scratch.path(),
        launcher.clone(),
    )
    .unwrap();

    let outcome = orch.run().await.unwrap();
    match outcome {
        RunOutcome::Paused(reason) => assert!(reason.contains("PAY-001")),
        other => panic!("expected pause, got {:?}", other),
    }

    let report = orch.status();
    // The level never completed and the run did not advance.
    assert_eq!(report.current_level, 0);
    assert_eq!(report.blocked, 1);
    let pay1 = report.tasks.iter().find(|t| t.id == "PAY-001").unwrap();
    assert!(pay1.status.starts_with("blocked"));
    assert_eq!(pay1.attempts, 2);

    // The dependent level-1 task was never launched.
    let launched: Vec<String> = launcher.launches().into_iter().map(|(_, t)| t).collect();
    assert!(!launched.contains(&"PAY-003".to_string()));
    // The failing task consumed both attempts.
    assert_eq!(launched.iter().filter(|t| *t == "PAY-001").count(), 2);

    let state = StatePersistence::load(&state_path(scratch.path(), "pay")).unwrap();
    assert!(state.paused.is_some());
}

#[tokio::test]
async fn forced_retry_after_block_completes_the_run() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let graph_json = r#"{
        "tasks": [
            {"id": "FIX-001", "title": "flaky task", "dependencies": [],
             "files": {"create": ["src/flaky.rs"]},
             "verification": {"command": "true", "timeout_seconds": 30}}
        ]
    }"#;

    // First run: the task always fails and ends up blocked.
    let failing = Arc::new(NullLauncher::new().script("FIX-001", NullOutcome::Fail("boom".into())));
    let mut orch = orchestrator(
        &repo,
        build_graph(graph_json),
        test_config(scratch.path()),
        "fix",
        scratch.path(),
        failing,
    )
    .unwrap();
    assert!(matches!(orch.run().await.unwrap(), RunOutcome::Paused(_)));
    drop(orch);

    // Operator fixes the cause, force-retries, and resumes with a
    // healthy worker.
    let healthy = Arc::new(NullLauncher::new());
    let mut orch = resume_orchestrator(
        &repo,
        build_graph(graph_json),
        test_config(scratch.path()),
        "fix",
        scratch.path(),
        healthy,
    )
    .unwrap();
    orch.retry(RetryTarget::Task(tid("FIX-001")), true).unwrap();
    assert_eq!(orch.run().await.unwrap(), RunOutcome::Complete);

    let report = orch.status();
    let task = report.tasks.iter().find(|t| t.id == "FIX-001").unwrap();
    assert_eq!(task.status, "complete");
    // Forced retry reset the attempt counter before the clean run.
    assert_eq!(task.attempts, 1);
}
