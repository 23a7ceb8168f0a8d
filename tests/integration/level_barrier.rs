//! End-to-end run over a 2-level graph with bounded concurrency.

use std::sync::Arc;

use foreman::orchestrator::RunOutcome;
use foreman::state::StatePersistence;
use foreman::worker::NullLauncher;
use foreman::TaskStatus;
use tempfile::TempDir;

use crate::fixtures::{build_graph, orchestrator, state_path, test_config, TestRepo};

const TWO_LEVEL_GRAPH: &str = r#"{
    "tasks": [
        {"id": "AUTH-001", "title": "user model", "dependencies": [],
         "files": {"create": ["src/models/user.rs"]},
         "verification": {"command": "true", "timeout_seconds": 30}},
        {"id": "AUTH-002", "title": "session store", "dependencies": [],
         "files": {"create": ["src/store.rs"]},
         "verification": {"command": "true", "timeout_seconds": 30}},
        {"id": "AUTH-003", "title": "password hashing", "dependencies": [],
         "files": {"create": ["src/hash.rs"]},
         "verification": {"command": "true", "timeout_seconds": 30}},
        {"id": "AUTH-004", "title": "login endpoint",
         "dependencies": ["AUTH-001", "AUTH-002", "AUTH-003"],
         "files": {"create": ["src/routes/login.rs"]},
         "verification": {"command": "true", "timeout_seconds": 30}}
    ]
}"#;

#[tokio::test]
async fn two_level_run_completes_with_bounded_concurrency() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let launcher = Arc::new(NullLauncher::new());
    let config = test_config(scratch.path()); // max_concurrent = 2

    let graph = build_graph(TWO_LEVEL_GRAPH);
    assert_eq!(graph.level_count(), 2);

    let mut orch = orchestrator(
        &repo,
        graph,
        config,
        "auth",
        scratch.path(),
        launcher.clone(),
    )
    .unwrap();
    let outcome = orch.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Complete);

    let report = orch.status();
    assert_eq!(report.run_state, "complete");
    assert_eq!(report.complete, 4);
    assert_eq!(report.blocked, 0);
    assert_eq!(report.current_level, 2);

    // The barrier held: the level-1 task launched only after all three
    // level-0 tasks.
    let launches = launcher.launches();
    assert_eq!(launches.len(), 4);
    assert_eq!(launches[3].1, "AUTH-004");

    // Promoted feature branch exists after the run.
    assert!(!repo.log_subjects("auth/main").is_empty());
}

#[tokio::test]
async fn state_file_reflects_the_finished_run() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let launcher = Arc::new(NullLauncher::new());
    let config = test_config(scratch.path());

    let mut orch = orchestrator(
        &repo,
        build_graph(TWO_LEVEL_GRAPH),
        config,
        "auth",
        scratch.path(),
        launcher,
    )
    .unwrap();
    orch.run().await.unwrap();

    let state = StatePersistence::load(&state_path(scratch.path(), "auth")).unwrap();
    assert_eq!(state.feature, "auth");
    assert_eq!(state.current_level, 2);
    assert!(state.paused.is_none());
    assert_eq!(state.tasks.len(), 4);
    assert!(state
        .tasks
        .values()
        .all(|t| matches!(t.status, TaskStatus::Complete)));
    // All workers reconciled away.
    assert!(state.workers.is_empty());
}

#[tokio::test]
async fn single_task_graph_round_trips() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let launcher = Arc::new(NullLauncher::new());

    let graph = build_graph(
        r#"{"tasks": [{"id": "ONE-001", "title": "only task", "dependencies": [],
            "files": {}, "verification": {"command": "true", "timeout_seconds": 5}}]}"#,
    );
    let mut orch = orchestrator(
        &repo,
        graph,
        test_config(scratch.path()),
        "solo",
        scratch.path(),
        launcher,
    )
    .unwrap();
    assert_eq!(orch.run().await.unwrap(), RunOutcome::Complete);
}
