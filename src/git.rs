//! Git plumbing used by the finalize workflow.
//!
//! [`WorktreeGit`] checks each task branch out into its own worktree so
//! finalizing never touches the main working directory.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::risk::DiffStat;
use crate::task::Task;

/// How the target branch is brought into the task branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Merge the target into the task branch with a merge commit.
    #[default]
    Merge,
    /// Replay the task branch on top of the target.
    Rebase,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::Merge => f.write_str("merge"),
            SyncStrategy::Rebase => f.write_str("rebase"),
        }
    }
}

/// Commits the task branch is ahead of and behind its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Divergence {
    pub ahead: u32,
    pub behind: u32,
}

/// Outcome of a sync step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    /// HEAD after the step. Meaningless while conflicts are pending.
    pub head: String,
    /// True if the step created or moved to a new commit.
    pub updated: bool,
    /// Files left unmerged. Non-empty means the merge or rebase is still in
    /// progress and must be continued or aborted.
    pub conflict_files: Vec<String>,
}

impl SyncOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflict_files.is_empty()
    }
}

/// Git operations needed to finalize a task.
#[async_trait]
pub trait GitService: Send + Sync {
    /// Prepares a working copy of the task branch and returns its path.
    async fn init_sync(&self, task: &Task) -> Result<PathBuf>;

    /// Fetches `target` and counts commits on each side.
    async fn divergence(&self, worktree: &Path, target: &str) -> Result<Divergence>;

    async fn head(&self, worktree: &Path) -> Result<String>;

    /// Brings the latest `target` branch into the checked out task branch.
    ///
    /// On conflicts the operation is left in progress.
    async fn sync_with_target(
        &self,
        worktree: &Path,
        target: &str,
        strategy: SyncStrategy,
    ) -> Result<SyncOutcome>;

    /// Stages `resolved` and continues the in-progress sync. A rebase may
    /// stop again on the next commit with new conflicts.
    async fn continue_sync(
        &self,
        worktree: &Path,
        strategy: SyncStrategy,
        resolved: &[String],
    ) -> Result<SyncOutcome>;

    async fn abort_sync(&self, worktree: &Path, strategy: SyncStrategy) -> Result<()>;

    /// Size of the task branch's changes since it forked from `target`.
    async fn diff_stat(&self, worktree: &Path, target: &str) -> Result<DiffStat>;

    async fn push_branch(&self, worktree: &Path, branch: &str) -> Result<()>;

    /// Removes the task's worktree, if any.
    async fn cleanup_worktree(&self, task: &Task) -> Result<()>;
}

/// Runs git in `dir`, returning trimmed stdout.
async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        // Never open an editor for merge or rebase messages.
        .env("GIT_EDITOR", "true")
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Git service backed by the git CLI and per-task worktrees.
#[derive(Clone)]
pub struct WorktreeGit {
    repo_path: PathBuf,
    worktree_dir: Option<PathBuf>,
    remote: String,
}

impl WorktreeGit {
    /// `worktree_dir` defaults to a directory under the system temp dir.
    pub fn new(repo_path: PathBuf, worktree_dir: Option<PathBuf>) -> Self {
        Self {
            repo_path,
            worktree_dir,
            remote: "origin".to_string(),
        }
    }

    /// Returns where the task's worktree lives.
    pub fn worktree_path(&self, task: &Task) -> PathBuf {
        let base = match &self.worktree_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("task-finalizer-worktrees"),
        };
        base.join(&task.id)
    }

    async fn has_remote(&self, dir: &Path) -> Result<bool> {
        let remotes = git(dir, &["remote"]).await?;
        Ok(remotes.lines().any(|r| r.trim() == self.remote))
    }

    async fn unmerged_files(dir: &Path) -> Result<Vec<String>> {
        let out = git(dir, &["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Ref the target branch is read from: the remote copy when there is a
    /// remote, fetched first if `fetch` is set.
    async fn target_ref(&self, worktree: &Path, target: &str, fetch: bool) -> Result<String> {
        if !self.has_remote(worktree).await? {
            return Ok(target.to_string());
        }
        if fetch {
            git(worktree, &["fetch", &self.remote, target]).await?;
        }
        Ok(format!("{}/{}", self.remote, target))
    }

    /// Turns a failed merge or rebase into a conflict outcome, or the error
    /// itself when nothing is unmerged.
    async fn conflict_outcome(
        worktree: &Path,
        strategy: SyncStrategy,
        before: String,
        err: Error,
    ) -> Result<SyncOutcome> {
        let conflict_files = Self::unmerged_files(worktree).await?;
        if conflict_files.is_empty() {
            if strategy == SyncStrategy::Rebase {
                // Leave no half-applied rebase behind a plain failure.
                let _ = git(worktree, &["rebase", "--abort"]).await;
            }
            return Err(err);
        }
        tracing::warn!(
            path = ?worktree,
            strategy = %strategy,
            conflicts = conflict_files.len(),
            "sync with target branch has conflicts"
        );
        Ok(SyncOutcome {
            head: before,
            updated: false,
            conflict_files,
        })
    }
}

#[async_trait]
impl GitService for WorktreeGit {
    async fn init_sync(&self, task: &Task) -> Result<PathBuf> {
        if task.branch.is_empty() {
            return Err(Error::Validation(format!("task {} has no branch", task.id)));
        }

        let path = self.worktree_path(task);
        if path.join(".git").exists() {
            tracing::debug!(task_id = %task.id, path = ?path, "reusing worktree");
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_str = path.to_string_lossy().into_owned();
        if let Err(e) = git(&self.repo_path, &["worktree", "add", &path_str, &task.branch]).await {
            // Branch only exists on the remote: create a local tracking branch.
            if !self.has_remote(&self.repo_path).await? {
                return Err(e);
            }
            git(&self.repo_path, &["fetch", &self.remote, &task.branch]).await?;
            let upstream = format!("{}/{}", self.remote, task.branch);
            git(
                &self.repo_path,
                &["worktree", "add", "-B", &task.branch, &path_str, &upstream],
            )
            .await?;
        }

        tracing::info!(task_id = %task.id, path = ?path, branch = %task.branch, "created finalize worktree");
        Ok(path)
    }

    async fn divergence(&self, worktree: &Path, target: &str) -> Result<Divergence> {
        let target_ref = self.target_ref(worktree, target, true).await?;
        let range = format!("HEAD...{}", target_ref);
        let out = git(worktree, &["rev-list", "--left-right", "--count", &range]).await?;

        let mut counts = out.split_whitespace().map(str::parse::<u32>);
        match (counts.next(), counts.next()) {
            (Some(Ok(ahead)), Some(Ok(behind))) => Ok(Divergence { ahead, behind }),
            _ => Err(Error::Git(format!("unexpected rev-list output: {}", out))),
        }
    }

    async fn head(&self, worktree: &Path) -> Result<String> {
        git(worktree, &["rev-parse", "HEAD"]).await
    }

    async fn sync_with_target(
        &self,
        worktree: &Path,
        target: &str,
        strategy: SyncStrategy,
    ) -> Result<SyncOutcome> {
        let before = self.head(worktree).await?;
        let target_ref = self.target_ref(worktree, target, true).await?;

        let synced = match strategy {
            SyncStrategy::Merge => {
                git(worktree, &["merge", "--no-ff", "--no-edit", &target_ref]).await
            }
            SyncStrategy::Rebase => git(worktree, &["rebase", &target_ref]).await,
        };
        if let Err(e) = synced {
            return Self::conflict_outcome(worktree, strategy, before, e).await;
        }

        let head = self.head(worktree).await?;
        Ok(SyncOutcome {
            updated: head != before,
            head,
            conflict_files: Vec::new(),
        })
    }

    async fn continue_sync(
        &self,
        worktree: &Path,
        strategy: SyncStrategy,
        resolved: &[String],
    ) -> Result<SyncOutcome> {
        if !resolved.is_empty() {
            let mut args = vec!["add", "--"];
            args.extend(resolved.iter().map(String::as_str));
            git(worktree, &args).await?;
        }

        let before = self.head(worktree).await?;
        let continued = match strategy {
            SyncStrategy::Merge => git(worktree, &["commit", "--no-edit"]).await,
            SyncStrategy::Rebase => git(worktree, &["rebase", "--continue"]).await,
        };
        if let Err(e) = continued {
            return Self::conflict_outcome(worktree, strategy, before, e).await;
        }

        let head = self.head(worktree).await?;
        Ok(SyncOutcome {
            updated: true,
            head,
            conflict_files: Vec::new(),
        })
    }

    async fn abort_sync(&self, worktree: &Path, strategy: SyncStrategy) -> Result<()> {
        match strategy {
            SyncStrategy::Merge => git(worktree, &["merge", "--abort"]).await?,
            SyncStrategy::Rebase => git(worktree, &["rebase", "--abort"]).await?,
        };
        tracing::info!(path = ?worktree, strategy = %strategy, "aborted conflicted sync");
        Ok(())
    }

    async fn diff_stat(&self, worktree: &Path, target: &str) -> Result<DiffStat> {
        let target_ref = self.target_ref(worktree, target, false).await?;
        let range = format!("{}...HEAD", target_ref);
        let out = git(worktree, &["diff", "--numstat", &range]).await?;
        Ok(DiffStat::parse_numstat(&out))
    }

    async fn push_branch(&self, worktree: &Path, branch: &str) -> Result<()> {
        git(worktree, &["push", "-u", &self.remote, branch]).await?;
        Ok(())
    }

    async fn cleanup_worktree(&self, task: &Task) -> Result<()> {
        let path = self.worktree_path(task);
        if !path.exists() {
            return Ok(());
        }
        let path_str = path.to_string_lossy().into_owned();
        git(&self.repo_path, &["worktree", "remove", "--force", &path_str]).await?;
        tracing::info!(task_id = %task.id, path = ?path, "removed finalize worktree");
        Ok(())
    }
}
