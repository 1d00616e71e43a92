//! Per-task git worktree lifecycle.
//!
//! Every dispatched task gets its own worktree isolated from the main
//! checkout, created as a sibling of the project directory:
//! `parent(project)/push-{display_number}-{machine_suffix}`, on a branch of
//! the identical name. The machine suffix keeps branches from colliding when
//! a stale claim lets a second machine pick up the same task later.
//!
//! Removal deletes only the worktree directory — the branch is kept so a
//! human can review what the assistant did.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct WorktreeManager {
    suffix: String,
}

impl WorktreeManager {
    pub fn new(machine_suffix: impl Into<String>) -> Self {
        Self {
            suffix: machine_suffix.into(),
        }
    }

    /// Branch name and worktree directory leaf: `push-{N}-{suffix}`.
    pub fn branch_name(&self, display_number: u64) -> String {
        format!("push-{display_number}-{}", self.suffix)
    }

    /// Worktree location: a sibling of the project checkout.
    pub fn worktree_path(&self, display_number: u64, project_path: &Path) -> PathBuf {
        let parent = project_path.parent().unwrap_or(project_path);
        parent.join(self.branch_name(display_number))
    }

    /// Create the worktree for a task, returning its path.
    ///
    /// An already-existing directory is returned as-is (a previous run of
    /// the same task on this machine). The branch is created from HEAD, or
    /// re-attached if it already exists.
    pub async fn create(&self, display_number: u64, project_path: &Path) -> Result<PathBuf> {
        let branch = self.branch_name(display_number);
        let wt_path = self.worktree_path(display_number, project_path);

        if wt_path.exists() {
            debug!(branch = %branch, "worktree directory already exists — reusing");
            return Ok(wt_path);
        }

        let repo_path = project_path.to_path_buf();
        let branch_name = branch.clone();
        let wt = wt_path.clone();
        tokio::task::spawn_blocking(move || create_blocking(&repo_path, &branch_name, &wt))
            .await
            .context("worktree creation task panicked")??;

        info!(display_number, branch = %branch, path = %wt_path.display(), "worktree created");
        Ok(wt_path)
    }

    /// Remove the worktree directory. The branch is preserved on purpose.
    /// Failures are logged and swallowed — a leftover directory must not
    /// block the reap pass.
    pub async fn remove(&self, display_number: u64, project_path: &Path) {
        let branch = self.branch_name(display_number);
        let wt_path = self.worktree_path(display_number, project_path);

        let repo_path = project_path.to_path_buf();
        let branch_name = branch.clone();
        let wt = wt_path.clone();
        let result =
            tokio::task::spawn_blocking(move || remove_blocking(&repo_path, &branch_name, &wt))
                .await;

        match result {
            Ok(Ok(())) => debug!(display_number, branch = %branch, "worktree removed"),
            Ok(Err(e)) => {
                warn!(display_number, err = %e, "worktree removal failed — cleaning directory manually");
                if wt_path.exists() {
                    let _ = tokio::fs::remove_dir_all(&wt_path).await;
                }
            }
            Err(e) => warn!(display_number, err = %e, "worktree removal task panicked"),
        }
    }

    /// Best-effort review request for a finished task.
    ///
    /// If the task branch has at least one commit ahead of the default
    /// branch, push it and open a PR through the `gh` CLI. Returns the PR
    /// URL on success. Every failure path is non-fatal and logged.
    pub async fn create_review_request(
        &self,
        display_number: u64,
        summary: &str,
        project_path: &Path,
    ) -> Option<String> {
        let branch = self.branch_name(display_number);

        let repo_path = project_path.to_path_buf();
        let branch_name = branch.clone();
        let ahead = tokio::task::spawn_blocking(move || commits_ahead(&repo_path, &branch_name))
            .await
            .ok()?;

        match ahead {
            Ok(0) => {
                debug!(display_number, branch = %branch, "no commits on task branch — skipping review request");
                return None;
            }
            Ok(n) => debug!(display_number, branch = %branch, commits = n, "pushing task branch"),
            Err(e) => {
                debug!(display_number, err = %e, "could not compare task branch — skipping review request");
                return None;
            }
        }

        let push = Command::new("git")
            .args(["push", "-u", "origin", &branch])
            .current_dir(project_path)
            .output()
            .await;
        match push {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                info!(display_number, stderr = %String::from_utf8_lossy(&out.stderr).trim(), "git push failed — no review request");
                return None;
            }
            Err(e) => {
                info!(display_number, err = %e, "git not runnable — no review request");
                return None;
            }
        }

        let title = format!("Push #{display_number}: {summary}");
        let pr = Command::new("gh")
            .args([
                "pr",
                "create",
                "--head",
                &branch,
                "--title",
                &title,
                "--body",
                "Automated change from a Push task. Review before merging.",
            ])
            .current_dir(project_path)
            .output()
            .await;

        match pr {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let url = stdout
                    .lines()
                    .rev()
                    .find(|l| l.trim().starts_with("http"))
                    .map(|l| l.trim().to_string());
                if let Some(ref url) = url {
                    info!(display_number, url = %url, "review request created");
                }
                url
            }
            Ok(out) => {
                info!(display_number, stderr = %String::from_utf8_lossy(&out.stderr).trim(), "gh pr create failed");
                None
            }
            Err(e) => {
                // gh not installed — the pushed branch is still reviewable.
                info!(display_number, err = %e, "gh CLI unavailable — branch pushed without PR");
                None
            }
        }
    }
}

// ─── Blocking git2 helpers ───────────────────────────────────────────────────

fn create_blocking(repo_path: &Path, branch_name: &str, wt_path: &Path) -> Result<()> {
    let repo = git2::Repository::open(repo_path)
        .context("failed to open repository for worktree creation")?;

    let head = repo.head().context("repository has no HEAD")?;
    let head_commit = head
        .peel_to_commit()
        .context("HEAD does not point to a commit")?;

    // New branch from HEAD; if a previous run of this task left one behind,
    // attach the existing branch instead.
    let branch = match repo.branch(branch_name, &head_commit, false) {
        Ok(b) => b,
        Err(e) if e.code() == git2::ErrorCode::Exists => {
            debug!(branch = branch_name, "branch already exists — attaching");
            repo.find_branch(branch_name, git2::BranchType::Local)
                .context("failed to find existing task branch")?
        }
        Err(e) => bail!("failed to create branch {branch_name}: {e}"),
    };

    let branch_ref = branch.get();
    let mut opts = git2::WorktreeAddOptions::new();
    opts.reference(Some(branch_ref));
    repo.worktree(branch_name, wt_path, Some(&opts))
        .context("failed to add git worktree")?;

    Ok(())
}

fn remove_blocking(repo_path: &Path, branch_name: &str, wt_path: &Path) -> Result<()> {
    let repo = git2::Repository::open(repo_path)
        .context("failed to open repository for worktree removal")?;

    if let Ok(wt) = repo.find_worktree(branch_name) {
        let mut opts = git2::WorktreePruneOptions::new();
        opts.valid(true).working_tree(true);
        wt.prune(Some(&mut opts)).context("failed to prune worktree")?;
    }

    if wt_path.exists() {
        std::fs::remove_dir_all(wt_path).context("failed to remove worktree directory")?;
    }
    Ok(())
}

/// How many commits the task branch is ahead of the default branch.
fn commits_ahead(repo_path: &Path, branch_name: &str) -> Result<usize> {
    let repo = git2::Repository::open(repo_path).context("failed to open repository")?;

    let branch = repo
        .find_branch(branch_name, git2::BranchType::Local)
        .context("task branch not found")?;
    let branch_oid = branch
        .get()
        .target()
        .context("task branch has no target commit")?;

    let base_oid = default_branch_target(&repo).context("no default branch to compare against")?;

    let (ahead, _behind) = repo
        .graph_ahead_behind(branch_oid, base_oid)
        .context("failed to compare branches")?;
    Ok(ahead)
}

fn default_branch_target(repo: &git2::Repository) -> Option<git2::Oid> {
    // origin/HEAD names the true default; fall back to the usual suspects.
    if let Ok(reference) = repo.find_reference("refs/remotes/origin/HEAD") {
        if let Ok(resolved) = reference.resolve() {
            if let Some(oid) = resolved.target() {
                return Some(oid);
            }
        }
    }
    for name in ["main", "master"] {
        if let Ok(branch) = repo.find_branch(name, git2::BranchType::Local) {
            if let Some(oid) = branch.get().target() {
                return Some(oid);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_and_directory_names_match() {
        let manager = WorktreeManager::new("a1b2c3d4");
        assert_eq!(manager.branch_name(427), "push-427-a1b2c3d4");

        let wt = manager.worktree_path(427, Path::new("/tmp/projects/repo"));
        assert_eq!(wt, PathBuf::from("/tmp/projects/push-427-a1b2c3d4"));
        assert_eq!(
            wt.file_name().unwrap().to_string_lossy(),
            manager.branch_name(427)
        );
    }
}
