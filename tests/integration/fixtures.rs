//! Shared fixtures: throwaway git repositories and orchestrator
//! wiring against the in-process null launcher.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use foreman::config::{BackoffConfig, BackoffStrategy, Config, LauncherMode};
use foreman::graph::{GraphSpec, TaskGraph};
use foreman::orchestrator::{CommandGate, Orchestrator};
use foreman::worker::WorkerLauncher;
use foreman::Result;

/// A real git repository in a temp directory, driven through the git
/// CLI the way a user's repository would be.
pub struct TestRepo {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    /// Initialize a repo on branch `main` with one commit.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("create repo dir");

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.name", "Test"]);
        git(&path, &["config", "user.email", "test@localhost"]);
        std::fs::write(path.join("README.md"), "# test\n").expect("write readme");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "initial commit"]);

        Self { _dir: dir, path }
    }

    /// Write a file and commit it on the currently checked out branch.
    pub fn commit_file(&self, rel: &str, content: &str, message: &str) {
        self.commit_file_in(&self.path, rel, content, message);
    }

    /// Write and commit inside an arbitrary worktree directory.
    pub fn commit_file_in(&self, dir: &Path, rel: &str, content: &str, message: &str) {
        let file = dir.join(rel);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&file, content).expect("write file");
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", message]);
    }

    /// Whether `rel` exists in the tree at the tip of `branch`.
    pub fn file_on_branch(&self, branch: &str, rel: &str) -> bool {
        Command::new("git")
            .args(["cat-file", "-e", &format!("{}:{}", branch, rel)])
            .current_dir(&self.path)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Commit subjects on `branch`, newest first.
    pub fn log_subjects(&self, branch: &str) -> Vec<String> {
        let output = Command::new("git")
            .args(["log", "--format=%s", branch])
            .current_dir(&self.path)
            .output()
            .expect("git log");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.to_string())
            .collect()
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Config tuned for tests: null launcher, short intervals, worktrees
/// and state kept under the given scratch directory.
pub fn test_config(scratch: &Path) -> Config {
    Config {
        max_concurrent: 2,
        retry_attempts: 1,
        poll_interval_ms: 25,
        stall_timeout_secs: 10,
        launcher: LauncherMode::Null,
        worktree_dir: Some(scratch.join("worktrees").display().to_string()),
        backoff: BackoffConfig {
            strategy: BackoffStrategy::Linear,
            base_ms: 10,
            max_ms: 50,
        },
        ..Default::default()
    }
}

pub fn state_path(scratch: &Path, feature: &str) -> PathBuf {
    scratch.join(format!("{}.state.json", feature))
}

pub fn build_graph(json: &str) -> TaskGraph {
    TaskGraph::build(GraphSpec::from_json(json).expect("parse graph")).expect("build graph")
}

/// Fresh orchestrator over `repo` with a pass-through gate.
pub fn orchestrator(
    repo: &TestRepo,
    graph: TaskGraph,
    config: Config,
    feature: &str,
    scratch: &Path,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<Orchestrator> {
    Orchestrator::new(
        config,
        graph,
        &repo.path,
        "main",
        feature,
        &state_path(scratch, feature),
        launcher,
        Box::new(CommandGate::new(None, Duration::from_secs(30))),
    )
}

pub fn resume_orchestrator(
    repo: &TestRepo,
    graph: TaskGraph,
    config: Config,
    feature: &str,
    scratch: &Path,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<Orchestrator> {
    Orchestrator::resume(
        config,
        graph,
        &repo.path,
        "main",
        feature,
        &state_path(scratch, feature),
        launcher,
        Box::new(CommandGate::new(None, Duration::from_secs(30))),
    )
}
