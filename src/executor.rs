//! Phase execution and CI merge collaborators of the finalize workflow.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::config::{CompletionConfig, RiskAssessmentConfig};
use crate::error::{Error, Result};
use crate::git::{GitService, SyncOutcome, SyncStrategy};
use crate::hosting::{ChecksStatus, HostingProvider, MergeMethod};
use crate::risk::RiskAssessment;
use crate::task::Task;

/// Upper bound on resolve-and-continue rounds. A rebase stops once per
/// conflicting commit.
const MAX_RESOLVE_ROUNDS: usize = 10;

/// Progress reported by a phase executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseProgress {
    Running(String),
    Completed,
}

/// Receives progress from a running phase.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: PhaseProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(PhaseProgress) + Send + Sync,
{
    fn on_progress(&self, progress: PhaseProgress) {
        self(progress)
    }
}

/// Where a phase runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseContext {
    pub worktree: PathBuf,
    pub target_branch: String,
}

/// What a successful phase produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhaseOutcome {
    pub commit_sha: Option<String>,
    pub synced: bool,
    /// Number of distinct files whose conflicts were resolved.
    pub conflicts_resolved: u32,
    pub conflict_files: Vec<String>,
    pub tests_passed: Option<bool>,
    pub risk: RiskAssessment,
}

/// Runs one phase of a task.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        phase: &str,
        ctx: &PhaseContext,
        progress: &dyn ProgressObserver,
    ) -> Result<PhaseOutcome>;
}

/// Resolves conflicts left by a sync.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Edits `files` in `worktree` until they hold no conflict markers.
    /// Staging and continuing the sync is left to the caller.
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        worktree: &Path,
        files: &[String],
    ) -> Result<()>;
}

/// Resolver that runs a shell command in the worktree.
///
/// The conflicted paths are passed newline separated in
/// `FINALIZE_CONFLICT_FILES`.
pub struct CommandConflictResolver {
    command: String,
}

impl CommandConflictResolver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ConflictResolver for CommandConflictResolver {
    async fn resolve(
        &self,
        cancel: &CancellationToken,
        worktree: &Path,
        files: &[String],
    ) -> Result<()> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env("FINALIZE_CONFLICT_FILES", files.join("\n"));
        run_shell(cancel, command, worktree, "conflict resolution").await
    }
}

/// Runs a prepared shell command in `dir`, failing the phase on a non-zero
/// exit with the tail of its stderr.
async fn run_shell(
    cancel: &CancellationToken,
    mut command: Command,
    dir: &Path,
    what: &str,
) -> Result<()> {
    let child = command.current_dir(dir).kill_on_drop(true).output();

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(Error::Cancelled(format!("{} interrupted", what)));
        }
        output = child => output?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(Error::Phase(format!(
            "{} failed ({}): {}",
            what,
            output.status,
            tail.join("\n")
        )));
    }
    Ok(())
}

/// Finalize phase: bring the target branch in, resolve conflicts when a
/// resolver is configured, run tests and assess risk.
pub struct SyncPhaseExecutor {
    git: Arc<dyn GitService>,
    test_command: Option<String>,
    strategy: SyncStrategy,
    risk: RiskAssessmentConfig,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl SyncPhaseExecutor {
    pub fn new(git: Arc<dyn GitService>, config: &CompletionConfig) -> Self {
        let resolver = config.conflict_command.as_ref().map(|command| {
            Arc::new(CommandConflictResolver::new(command.clone())) as Arc<dyn ConflictResolver>
        });
        Self {
            git,
            test_command: config.test_command.clone(),
            strategy: config.sync_strategy,
            risk: config.risk_assessment.clone(),
            resolver,
        }
    }

    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn abort_quietly(&self, worktree: &Path) {
        if let Err(e) = self.git.abort_sync(worktree, self.strategy).await {
            tracing::warn!(error = %e, path = ?worktree, "failed to abort conflicted sync");
        }
    }

    /// Drives a conflicted sync to completion, returning the final outcome
    /// and every file that needed resolving. Aborts the sync on failure.
    async fn resolve_conflicts(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        ctx: &PhaseContext,
        mut sync: SyncOutcome,
        progress: &dyn ProgressObserver,
    ) -> Result<(SyncOutcome, Vec<String>)> {
        let Some(resolver) = &self.resolver else {
            self.abort_quietly(&ctx.worktree).await;
            return Err(Error::Phase(format!(
                "{} conflicts with {} in {} file(s): {}",
                self.strategy,
                ctx.target_branch,
                sync.conflict_files.len(),
                sync.conflict_files.join(", ")
            )));
        };

        let mut resolved: Vec<String> = Vec::new();
        for round in 0..MAX_RESOLVE_ROUNDS {
            if !sync.has_conflicts() {
                return Ok((sync, resolved));
            }
            progress.on_progress(PhaseProgress::Running(format!(
                "Resolving {} conflicted file(s)",
                sync.conflict_files.len()
            )));
            tracing::info!(
                task_id = %task.id,
                round,
                files = ?sync.conflict_files,
                "resolving sync conflicts"
            );
            for file in &sync.conflict_files {
                if !resolved.contains(file) {
                    resolved.push(file.clone());
                }
            }

            let step = self.resolve_round(cancel, resolver.as_ref(), ctx, &sync).await;
            sync = match step {
                Ok(next) => next,
                Err(e) => {
                    self.abort_quietly(&ctx.worktree).await;
                    return Err(e);
                }
            };
        }

        if !sync.has_conflicts() {
            return Ok((sync, resolved));
        }
        self.abort_quietly(&ctx.worktree).await;
        Err(Error::Phase(format!(
            "conflicts remain after {} resolution rounds",
            MAX_RESOLVE_ROUNDS
        )))
    }

    async fn resolve_round(
        &self,
        cancel: &CancellationToken,
        resolver: &dyn ConflictResolver,
        ctx: &PhaseContext,
        sync: &SyncOutcome,
    ) -> Result<SyncOutcome> {
        resolver
            .resolve(cancel, &ctx.worktree, &sync.conflict_files)
            .await?;

        // Resolved files must be free of conflict markers before staging.
        let mut unresolved = Vec::new();
        for file in &sync.conflict_files {
            let content = tokio::fs::read_to_string(ctx.worktree.join(file))
                .await
                .unwrap_or_default();
            if content.contains("<<<<<<<") || content.contains(">>>>>>>") {
                unresolved.push(file.clone());
            }
        }
        if !unresolved.is_empty() {
            return Err(Error::Phase(format!(
                "conflict resolution left markers in: {}",
                unresolved.join(", ")
            )));
        }

        self.git
            .continue_sync(&ctx.worktree, self.strategy, &sync.conflict_files)
            .await
    }

    async fn assess_risk(&self, task: &Task, ctx: &PhaseContext, conflicts: u32) -> RiskAssessment {
        if !self.risk.enabled {
            return RiskAssessment::default();
        }
        match self.git.diff_stat(&ctx.worktree, &ctx.target_branch).await {
            Ok(stat) => {
                let risk = RiskAssessment::assess(stat, conflicts, self.risk.re_review_threshold);
                if risk.needs_review {
                    tracing::warn!(
                        task_id = %task.id,
                        risk_level = %risk.level,
                        files_changed = risk.files_changed,
                        lines_changed = risk.lines_changed,
                        conflicts_resolved = conflicts,
                        "changes require additional review"
                    );
                }
                risk
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "risk assessment failed");
                RiskAssessment::default()
            }
        }
    }
}

#[async_trait]
impl PhaseExecutor for SyncPhaseExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        phase: &str,
        ctx: &PhaseContext,
        progress: &dyn ProgressObserver,
    ) -> Result<PhaseOutcome> {
        progress.on_progress(PhaseProgress::Running(
            "Checking branch divergence".to_string(),
        ));
        let divergence = self.git.divergence(&ctx.worktree, &ctx.target_branch).await?;
        tracing::info!(
            task_id = %task.id,
            ahead = divergence.ahead,
            behind = divergence.behind,
            "branch divergence"
        );

        let mut outcome = PhaseOutcome {
            synced: true,
            ..Default::default()
        };

        if divergence.behind == 0 {
            progress.on_progress(PhaseProgress::Running(
                "Branch already up-to-date with target branch".to_string(),
            ));
            outcome.commit_sha = Some(self.git.head(&ctx.worktree).await?);
        } else {
            progress.on_progress(PhaseProgress::Running(format!(
                "Syncing {} with {} ({} commits behind)",
                task.branch, ctx.target_branch, divergence.behind
            )));
            let mut sync = self
                .git
                .sync_with_target(&ctx.worktree, &ctx.target_branch, self.strategy)
                .await?;
            if sync.has_conflicts() {
                let (done, files) = self
                    .resolve_conflicts(cancel, task, ctx, sync, progress)
                    .await?;
                outcome.conflicts_resolved = files.len() as u32;
                outcome.conflict_files = files;
                sync = done;
            }
            tracing::info!(
                task_id = %task.id,
                phase,
                head = %sync.head,
                strategy = %self.strategy,
                conflicts_resolved = outcome.conflicts_resolved,
                "branch synced with target"
            );
            outcome.commit_sha = Some(sync.head);
        }

        if let Some(command) = self.test_command.as_deref() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("before tests".to_string()));
            }
            progress.on_progress(PhaseProgress::Running("Running tests".to_string()));
            let mut shell = Command::new("sh");
            shell.arg("-c").arg(command);
            run_shell(cancel, shell, &ctx.worktree, "tests").await?;
            outcome.tests_passed = Some(true);
        }

        progress.on_progress(PhaseProgress::Running(
            "Performing risk assessment".to_string(),
        ));
        outcome.risk = self
            .assess_risk(task, ctx, outcome.conflicts_resolved)
            .await;

        progress.on_progress(PhaseProgress::Completed);
        Ok(outcome)
    }
}

/// Result of waiting for CI and merging.
///
/// CI failures, timeouts and merge failures are reported in `error`, not as
/// an `Err`, because the branch is already synced at this point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CiMergeOutcome {
    pub pushed: bool,
    pub ci_passed: bool,
    pub ci_details: String,
    pub ci_timed_out: bool,
    pub merged: bool,
    pub merge_commit: Option<String>,
    pub error: Option<String>,
}

/// Pushes, waits for CI, and merges.
#[async_trait]
pub trait CiMerger: Send + Sync {
    /// Returns `Err` only on cancellation or when there is nothing to wait for.
    async fn wait_for_ci_and_merge(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        worktree: &Path,
    ) -> Result<CiMergeOutcome>;
}

/// CI merger using the hosting provider's check summary.
pub struct GhCiMerger {
    git: Arc<dyn GitService>,
    hosting: Arc<dyn HostingProvider>,
    config: CompletionConfig,
}

impl GhCiMerger {
    pub fn new(
        git: Arc<dyn GitService>,
        hosting: Arc<dyn HostingProvider>,
        config: CompletionConfig,
    ) -> Self {
        Self {
            git,
            hosting,
            config,
        }
    }
}

#[async_trait]
impl CiMerger for GhCiMerger {
    async fn wait_for_ci_and_merge(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        worktree: &Path,
    ) -> Result<CiMergeOutcome> {
        let mut outcome = CiMergeOutcome::default();

        match self.git.push_branch(worktree, &task.branch).await {
            Ok(()) => outcome.pushed = true,
            // The branch may already be up to date on the remote.
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to push finalize changes"),
        }

        let pr = self
            .hosting
            .find_pr_by_branch(&task.branch)
            .await?
            .ok_or_else(|| Error::Ci(format!("no pull request for branch {}", task.branch)))?;

        let timeout = Duration::from_secs(self.config.ci_timeout_secs);
        let deadline = Instant::now() + timeout;
        let mut backoff = ExponentialBackoff::for_ci(&self.config);

        tracing::info!(task_id = %task.id, pr = pr.number, timeout = ?timeout, "waiting for CI checks");

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("CI wait interrupted".to_string()));
            }

            match self.hosting.get_pr_status_summary(&pr).await {
                Ok(summary) => {
                    outcome.ci_details = format!("checks {}", summary.checks_status);
                    match summary.checks_status {
                        ChecksStatus::Success | ChecksStatus::None => {
                            outcome.ci_passed = true;
                            break;
                        }
                        ChecksStatus::Failure => {
                            tracing::error!(
                                task_id = %task.id,
                                pr = pr.number,
                                failed = ?summary.failed_checks,
                                "CI checks failed"
                            );
                            let error = if summary.failed_checks.is_empty() {
                                "CI checks failed".to_string()
                            } else {
                                format!("CI checks failed: {}", summary.failed_checks.join(", "))
                            };
                            outcome.error = Some(error);
                            return Ok(outcome);
                        }
                        ChecksStatus::Pending | ChecksStatus::Unknown => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to check CI status");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                outcome.ci_timed_out = true;
                outcome.error = Some(format!(
                    "CI timeout after {}s, checks still pending",
                    timeout.as_secs()
                ));
                return Ok(outcome);
            }

            let delay = backoff.next_delay(deadline - now);
            tracing::debug!(task_id = %task.id, delay = ?delay, "CI checks pending");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("CI wait interrupted".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(task_id = %task.id, pr = pr.number, "CI checks passed");
        if !self.config.merge_on_ci_pass {
            return Ok(outcome);
        }

        match self.hosting.merge_pr(pr.number, MergeMethod::Squash).await {
            Ok(commit) => {
                outcome.merged = true;
                outcome.merge_commit = commit;
                tracing::info!(task_id = %task.id, pr = pr.number, commit = ?outcome.merge_commit, "merged pull request");
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, pr = pr.number, error = %e, "merge failed");
                outcome.error = Some(e.to_string());
            }
        }
        Ok(outcome)
    }
}
