//! Git worktree isolation and the level merge protocol.
//!
//! Each worker gets a dedicated branch checked out into a dedicated
//! directory sharing the base repository's object store. After a level
//! completes, worker branches are merged into staging sequentially in
//! worker-id order with no-fast-forward merge commits; the first
//! conflict stops the loop so it can be resolved without compounding.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, MergeOptions, Repository, Signature};

use crate::error::Result;
use crate::worker::WorkerId;
use crate::{flog_debug, flog_warn};

/// Outcome of merging one level's worker branches into staging.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// All branches merged (or were already up to date).
    Merged { commits: Vec<String> },
    /// Stopped at the first conflicting branch; later branches are
    /// left unmerged.
    Conflict {
        worker_id: WorkerId,
        paths: Vec<String>,
    },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }
}

pub struct WorktreeManager {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    feature: String,
}

impl WorktreeManager {
    pub fn new(repo_path: &Path, worktrees_dir: &Path, feature: &str) -> Result<Self> {
        flog_debug!(
            "WorktreeManager::new repo={} feature={}",
            repo_path.display(),
            feature
        );
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
            feature: feature.to_string(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn branch_name(&self, worker_id: WorkerId) -> String {
        format!("{}/worker-{}", self.feature, worker_id.short())
    }

    pub fn worktree_path(&self, worker_id: WorkerId) -> PathBuf {
        // Branch names contain slashes; the directory name must not.
        self.worktrees_dir
            .join(format!("{}-worker-{}", self.feature, worker_id.short()))
    }

    /// Create the worker's branch from `base_branch` and check it out
    /// into an isolated directory. Returns (worktree path, branch name).
    pub fn create(&self, worker_id: WorkerId, base_branch: &str) -> Result<(PathBuf, String)> {
        let branch = self.branch_name(worker_id);
        let path = self.worktree_path(worker_id);
        flog_debug!(
            "WorktreeManager::create branch={} path={}",
            branch,
            path.display()
        );
        std::fs::create_dir_all(&self.worktrees_dir)?;

        let repo = self.repo()?;
        let base = repo.find_branch(base_branch, git2::BranchType::Local)?;
        let commit = base.get().peel_to_commit()?;
        let branch_obj = repo.branch(&branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let worktree_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&branch)
            .to_string();
        repo.worktree(&worktree_name, &path, Some(&opts))?;
        Ok((path, branch))
    }

    /// Remove the worker's worktree directory and its git admin dir.
    ///
    /// Cleanup is attempted even when individual steps fail; a stale
    /// admin dir would leave git believing the branch is still checked
    /// out. The branch itself is retained unless `delete_branch`.
    pub fn cleanup(&self, worker_id: WorkerId, delete_branch: bool) -> Result<()> {
        let path = self.worktree_path(worker_id);
        let branch = self.branch_name(worker_id);
        flog_debug!("WorktreeManager::cleanup path={}", path.display());

        let repo = self.repo()?;
        let worktree_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    flog_warn!("worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }

        // Admin dir (.git/worktrees/<name>) must go too.
        if let Some(ref name) = worktree_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        if delete_branch {
            match repo.find_branch(&branch, git2::BranchType::Local) {
                Ok(mut branch_ref) => {
                    if let Err(e) = branch_ref.delete() {
                        flog_warn!("failed to delete branch '{}': {}", branch, e);
                    }
                }
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => flog_warn!("error looking up branch '{}': {}", branch, e),
            }
        }
        Ok(())
    }

    /// Prune administrative files for worktrees whose directories are gone.
    pub fn prune_stale(&self) -> Result<()> {
        let repo = self.repo()?;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(worktree) = repo.find_worktree(name) {
                if !worktree.path().exists() {
                    flog_debug!("pruning stale worktree reference: {}", name);
                    let _ = worktree.prune(Some(
                        git2::WorktreePruneOptions::new()
                            .valid(true)
                            .working_tree(true)
                            .locked(true),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether the worker's worktree has uncommitted changes.
    pub fn is_dirty(&self, worker_id: WorkerId) -> Result<bool> {
        let repo = Repository::open(self.worktree_path(worker_id))?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }

    /// Create `name` from `from` if it does not already exist.
    pub fn ensure_branch(&self, name: &str, from: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(name, git2::BranchType::Local) {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {
                let commit = repo
                    .find_branch(from, git2::BranchType::Local)?
                    .get()
                    .peel_to_commit()?;
                repo.branch(name, &commit, false)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Merge worker branches into `staging` sequentially, in worker-id
    /// order, each as a no-fast-forward merge commit. Stops at the
    /// first conflict and reports the failing worker with the
    /// conflicting paths; already-up-to-date branches are skipped.
    pub fn merge_level(
        &self,
        workers: &[(WorkerId, String)],
        staging: &str,
    ) -> Result<MergeOutcome> {
        let mut ordered: Vec<&(WorkerId, String)> = workers.iter().collect();
        ordered.sort_by_key(|(id, _)| *id);

        let mut commits = Vec::new();
        for (worker_id, branch) in ordered {
            flog_debug!("merge_level: merging {} into {}", branch, staging);
            match self.merge_branch(branch, staging)? {
                Some(BranchMerge::Commit(commit)) => commits.push(commit),
                Some(BranchMerge::Conflict(paths)) => {
                    flog_warn!(
                        "merge_level: conflict in {} ({} paths), stopping",
                        branch,
                        paths.len()
                    );
                    return Ok(MergeOutcome::Conflict {
                        worker_id: *worker_id,
                        paths,
                    });
                }
                None => {} // up to date
            }
        }
        Ok(MergeOutcome::Merged { commits })
    }

    fn merge_branch(&self, branch: &str, staging: &str) -> Result<Option<BranchMerge>> {
        let repo = self.repo()?;

        let staging_ref = repo.find_branch(staging, git2::BranchType::Local)?.into_reference();
        let staging_commit = staging_ref.peel_to_commit()?;
        let staging_name = staging_ref
            .name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("refs/heads/{}", staging));
        repo.checkout_tree(staging_commit.as_object(), None)?;
        repo.set_head(&staging_name)?;

        let their_commit = repo
            .find_branch(branch, git2::BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let their_annotated = repo.find_annotated_commit(their_commit.id())?;

        let (analysis, _preference) = repo.merge_analysis(&[&their_annotated])?;
        if analysis.is_up_to_date() {
            return Ok(None);
        }

        // No fast-forward: always go through a real merge so that every
        // integrated branch leaves a merge commit on staging.
        let mut merge_opts = MergeOptions::new();
        repo.merge(&[&their_annotated], Some(&mut merge_opts), None)?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.as_ref().or(conflict.their.as_ref()).or(conflict.ancestor.as_ref());
                if let Some(entry) = entry {
                    paths.push(String::from_utf8_lossy(&entry.path).to_string());
                }
            }
            paths.sort();
            paths.dedup();
            repo.cleanup_state()?;
            // Leave staging checked out clean.
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            return Ok(Some(BranchMerge::Conflict(paths)));
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Foreman", "foreman@localhost"))?;
        let message = format!("Merge branch '{}' into {}", branch, staging);
        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&staging_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
        Ok(Some(BranchMerge::Commit(commit_id.to_string())))
    }

    /// Fast-forward `feature_branch` to the tip of `staging` after the
    /// level's gates pass.
    pub fn promote(&self, staging: &str, feature_branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let staging_commit = repo
            .find_branch(staging, git2::BranchType::Local)?
            .get()
            .peel_to_commit()?;
        match repo.find_branch(feature_branch, git2::BranchType::Local) {
            Ok(branch) => {
                let mut reference = branch.into_reference();
                reference.set_target(
                    staging_commit.id(),
                    &format!("foreman: promote {} to {}", staging, feature_branch),
                )?;
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                repo.branch(feature_branch, &staging_commit, false)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

enum BranchMerge {
    Commit(String),
    Conflict(Vec<String>),
}
