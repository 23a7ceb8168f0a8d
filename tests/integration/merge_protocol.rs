//! Sequential stop-on-first-conflict merge behavior, driven directly
//! against `WorktreeManager` with real git repositories.

use foreman::worker::WorkerId;
use foreman::worktree::{MergeOutcome, WorktreeManager};
use tempfile::TempDir;

use crate::fixtures::TestRepo;

fn sorted_worker_ids(n: usize) -> Vec<WorkerId> {
    let mut ids: Vec<WorkerId> = (0..n).map(|_| WorkerId::new()).collect();
    ids.sort();
    ids
}

#[test]
fn merge_stops_at_first_conflict_and_reports_paths() {
    let repo = TestRepo::new();
    repo.commit_file("shared.txt", "base\n", "add shared file");

    let scratch = TempDir::new().unwrap();
    let manager = WorktreeManager::new(&repo.path, scratch.path(), "auth").unwrap();
    manager.ensure_branch("auth/staging", "main").unwrap();

    // Merge order is worker-id order, so sort first and script the
    // middle worker to conflict with the first.
    let ids = sorted_worker_ids(3);
    let (first, second, third) = (ids[0], ids[1], ids[2]);

    let (wt1, _) = manager.create(first, "auth/staging").unwrap();
    repo.commit_file_in(&wt1, "shared.txt", "first version\n", "first: edit shared");
    repo.commit_file_in(&wt1, "first.txt", "one\n", "first: own file");

    let (wt2, _) = manager.create(second, "auth/staging").unwrap();
    repo.commit_file_in(&wt2, "shared.txt", "second version\n", "second: edit shared");

    let (wt3, _) = manager.create(third, "auth/staging").unwrap();
    repo.commit_file_in(&wt3, "third.txt", "three\n", "third: own file");

    let branches: Vec<(WorkerId, String)> = ids
        .iter()
        .map(|&id| (id, manager.branch_name(id)))
        .collect();
    let outcome = manager.merge_level(&branches, "auth/staging").unwrap();

    match outcome {
        MergeOutcome::Conflict { worker_id, paths } => {
            assert_eq!(worker_id, second);
            assert_eq!(paths, vec!["shared.txt".to_string()]);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // The first branch landed before the conflict stopped the loop.
    assert!(repo.file_on_branch("auth/staging", "first.txt"));
    // The third branch was left unmerged.
    assert!(!repo.file_on_branch("auth/staging", "third.txt"));
}

#[test]
fn merge_creates_no_ff_commits_and_skips_up_to_date_branches() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let manager = WorktreeManager::new(&repo.path, scratch.path(), "auth").unwrap();
    manager.ensure_branch("auth/staging", "main").unwrap();

    let ids = sorted_worker_ids(2);
    let (wt1, _) = manager.create(ids[0], "auth/staging").unwrap();
    repo.commit_file_in(&wt1, "a.txt", "a\n", "add a");
    // Second worker commits nothing: its branch stays at the staging
    // tip and must be skipped, not merged.
    let (_wt2, _) = manager.create(ids[1], "auth/staging").unwrap();

    let branches: Vec<(WorkerId, String)> = ids
        .iter()
        .map(|&id| (id, manager.branch_name(id)))
        .collect();
    let outcome = manager.merge_level(&branches, "auth/staging").unwrap();

    match outcome {
        MergeOutcome::Merged { commits } => assert_eq!(commits.len(), 1),
        other => panic!("expected merged, got {:?}", other),
    }
    assert!(repo.file_on_branch("auth/staging", "a.txt"));
    // A single-parent fast-forward would leave no merge subject.
    let subjects = repo.log_subjects("auth/staging");
    assert!(
        subjects.iter().any(|s| s.starts_with("Merge branch")),
        "expected a merge commit, got {:?}",
        subjects
    );
}

#[test]
fn conflict_leaves_staging_resumable() {
    // After a conflict the repository must not be left mid-merge: a
    // second merge_level call over the same branches should behave
    // deterministically (first branch now up to date, same conflict).
    let repo = TestRepo::new();
    repo.commit_file("shared.txt", "base\n", "add shared file");

    let scratch = TempDir::new().unwrap();
    let manager = WorktreeManager::new(&repo.path, scratch.path(), "auth").unwrap();
    manager.ensure_branch("auth/staging", "main").unwrap();

    let ids = sorted_worker_ids(2);
    let (wt1, _) = manager.create(ids[0], "auth/staging").unwrap();
    repo.commit_file_in(&wt1, "shared.txt", "first\n", "first edit");
    let (wt2, _) = manager.create(ids[1], "auth/staging").unwrap();
    repo.commit_file_in(&wt2, "shared.txt", "second\n", "second edit");

    let branches: Vec<(WorkerId, String)> = ids
        .iter()
        .map(|&id| (id, manager.branch_name(id)))
        .collect();

    let first_run = manager.merge_level(&branches, "auth/staging").unwrap();
    assert!(matches!(first_run, MergeOutcome::Conflict { worker_id, .. } if worker_id == ids[1]));

    let second_run = manager.merge_level(&branches, "auth/staging").unwrap();
    assert!(matches!(second_run, MergeOutcome::Conflict { worker_id, .. } if worker_id == ids[1]));
}

#[test]
fn promote_fast_forwards_feature_branch() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let manager = WorktreeManager::new(&repo.path, scratch.path(), "auth").unwrap();
    manager.ensure_branch("auth/staging", "main").unwrap();

    let ids = sorted_worker_ids(1);
    let (wt, _) = manager.create(ids[0], "auth/staging").unwrap();
    repo.commit_file_in(&wt, "feature.txt", "work\n", "do the work");

    let branches = vec![(ids[0], manager.branch_name(ids[0]))];
    assert!(manager
        .merge_level(&branches, "auth/staging")
        .unwrap()
        .is_merged());

    manager.promote("auth/staging", "auth/main").unwrap();
    assert!(repo.file_on_branch("auth/main", "feature.txt"));
}

#[test]
fn cleanup_removes_worktree_and_admin_dir() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let manager = WorktreeManager::new(&repo.path, scratch.path(), "auth").unwrap();
    manager.ensure_branch("auth/staging", "main").unwrap();

    let id = WorkerId::new();
    let (path, branch) = manager.create(id, "auth/staging").unwrap();
    assert!(path.exists());

    manager.cleanup(id, false).unwrap();
    assert!(!path.exists());
    let admin = repo
        .path
        .join(".git")
        .join("worktrees")
        .join(path.file_name().unwrap());
    assert!(!admin.exists());

    // Branch survives cleanup so completed work stays mergeable.
    let repo2 = git2::Repository::open(&repo.path).unwrap();
    assert!(repo2.find_branch(&branch, git2::BranchType::Local).is_ok());
}

#[test]
fn is_dirty_detects_uncommitted_changes() {
    let repo = TestRepo::new();
    let scratch = TempDir::new().unwrap();
    let manager = WorktreeManager::new(&repo.path, scratch.path(), "auth").unwrap();
    manager.ensure_branch("auth/staging", "main").unwrap();

    let id = WorkerId::new();
    let (path, _) = manager.create(id, "auth/staging").unwrap();
    assert!(!manager.is_dirty(id).unwrap());

    std::fs::write(path.join("uncommitted.txt"), "oops\n").unwrap();
    assert!(manager.is_dirty(id).unwrap());
}
