//! The finalize procedure for one task.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{FinalizeOperation, FinalizeResult, OperationHandle};
use crate::backend::Backend;
use crate::config::FinalizerConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventPayload, Publisher};
use crate::executor::{CiMerger, PhaseContext, PhaseExecutor, PhaseProgress};
use crate::git::GitService;
use crate::task::{PhaseStatus, PrStatus, Task, FINALIZE_PHASE};

/// Step percentages published as the workflow advances.
pub mod checkpoint {
    pub const LOADING: u8 = 5;
    pub const GIT_SETUP: u8 = 10;
    pub const EXECUTING: u8 = 20;
    pub const PHASE_RUNNING: u8 = 50;
    /// Phase completion when a CI step still follows.
    pub const PHASE_DONE_BEFORE_CI: u8 = 80;
    pub const CI_WAIT: u8 = 85;
    pub const DONE: u8 = 100;
}

fn ensure_not_cancelled(cancel: &CancellationToken, when: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(when.to_string()));
    }
    Ok(())
}

/// Runs finalize steps against the collaborators and publishes progress.
pub struct FinalizeWorkflow {
    backend: Arc<dyn Backend>,
    git: Arc<dyn GitService>,
    executor: Arc<dyn PhaseExecutor>,
    ci_merger: Arc<dyn CiMerger>,
    publisher: Arc<dyn Publisher>,
    config: Arc<FinalizerConfig>,
}

impl FinalizeWorkflow {
    pub fn new(
        backend: Arc<dyn Backend>,
        git: Arc<dyn GitService>,
        executor: Arc<dyn PhaseExecutor>,
        ci_merger: Arc<dyn CiMerger>,
        publisher: Arc<dyn Publisher>,
        config: Arc<FinalizerConfig>,
    ) -> Self {
        Self {
            backend,
            git,
            executor,
            ci_merger,
            publisher,
            config,
        }
    }

    /// Publishes an operation snapshot as a finalize progress event.
    pub fn emit(&self, op: &FinalizeOperation) {
        self.publisher.publish(Event::new(
            op.task_id.clone(),
            EventPayload::FinalizeProgress(op.to_progress()),
        ));
    }

    fn emit_phase(&self, task_id: &str, status: PhaseStatus) {
        self.publisher.publish(Event::new(
            task_id,
            EventPayload::PhaseChanged {
                phase: FINALIZE_PHASE.to_string(),
                status,
            },
        ));
    }

    /// Runs the workflow to a terminal state. Never returns an error: every
    /// failure is recorded on the operation.
    pub async fn run(&self, cancel: CancellationToken, handle: OperationHandle) -> FinalizeOperation {
        match self.execute(&cancel, &handle).await {
            Ok(op) => {
                tracing::info!(
                    task_id = %op.task_id,
                    step = %op.step,
                    merged = op.result.as_ref().map(|r| r.merged).unwrap_or(false),
                    "finalize completed"
                );
                self.emit(&op);
                op
            }
            Err(e) => {
                let op = handle.fail(e.to_string());
                tracing::error!(task_id = %op.task_id, error = %e, "finalize failed");
                self.emit(&op);
                op
            }
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        handle: &OperationHandle,
    ) -> Result<FinalizeOperation> {
        let task_id = handle.task_id().to_string();

        ensure_not_cancelled(cancel, "before start")?;
        self.emit(&handle.checkpoint(
            "Loading configuration",
            "Reloading task",
            checkpoint::LOADING,
        ));
        let mut task = self.backend.load_task(&task_id).await?;

        ensure_not_cancelled(cancel, "during setup")?;
        self.emit(&handle.checkpoint(
            "Setting up git",
            "Initializing git sync",
            checkpoint::GIT_SETUP,
        ));
        let worktree = self.git.init_sync(&task).await?;

        ensure_not_cancelled(cancel, "before execution")?;
        self.emit(&handle.checkpoint(
            "Executing finalize",
            "Syncing with target branch",
            checkpoint::EXECUTING,
        ));

        task.execution.start_phase(FINALIZE_PHASE);
        if let Err(e) = self.backend.save_task(&task).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to persist finalize phase start");
        }
        self.emit_phase(&task_id, PhaseStatus::Running);

        let wait_for_ci = self.config.should_wait_for_ci();
        let done_percent = if wait_for_ci {
            checkpoint::PHASE_DONE_BEFORE_CI
        } else {
            checkpoint::DONE
        };
        let observer = |progress: PhaseProgress| {
            let op = match progress {
                PhaseProgress::Running(message) => {
                    handle.report(message, checkpoint::PHASE_RUNNING)
                }
                PhaseProgress::Completed => handle.advance(done_percent),
            };
            self.emit(&op);
        };

        let target_branch = self.config.completion.target_branch.clone();
        let ctx = PhaseContext {
            worktree: worktree.clone(),
            target_branch: target_branch.clone(),
        };

        let outcome = match self
            .executor
            .execute(cancel, &task, FINALIZE_PHASE, &ctx, &observer)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                task.execution.fail_phase(FINALIZE_PHASE, e.to_string());
                if let Err(save_err) = self.backend.save_task(&task).await {
                    tracing::warn!(task_id = %task_id, error = %save_err, "failed to persist finalize phase failure");
                }
                self.emit_phase(&task_id, PhaseStatus::Failed);
                return Err(e);
            }
        };

        task.execution
            .complete_phase(FINALIZE_PHASE, outcome.commit_sha.clone());
        if let Err(e) = self.backend.save_task(&task).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to persist finalize phase completion");
        }
        self.emit_phase(&task_id, PhaseStatus::Completed);

        let mut result = FinalizeResult {
            synced: outcome.synced,
            commit_sha: outcome.commit_sha,
            target_branch,
            conflicts_resolved: outcome.conflicts_resolved,
            conflict_files: outcome.conflict_files,
            tests_passed: outcome.tests_passed,
            risk_level: outcome.risk.level,
            files_changed: outcome.risk.files_changed,
            lines_changed: outcome.risk.lines_changed,
            needs_review: outcome.risk.needs_review,
            ..Default::default()
        };

        if wait_for_ci {
            ensure_not_cancelled(cancel, "before CI wait")?;
            self.emit(&handle.checkpoint(
                "Waiting for CI",
                "Pushing changes and waiting for CI checks",
                checkpoint::CI_WAIT,
            ));
            self.wait_for_ci(cancel, &task, &worktree, &mut result)
                .await?;
        }

        let (step, progress) = if result.merged {
            ("Merged", "PR merged successfully".to_string())
        } else if result.ci_passed {
            ("CI Passed", "CI passed, merge skipped".to_string())
        } else if let Some(merge_error) = &result.merge_error {
            ("Complete (merge pending)", merge_error.clone())
        } else {
            ("Complete", "Finalize completed successfully".to_string())
        };
        let op = handle.complete(step, progress, result);

        if self.config.worktree.cleanup_on_complete {
            if let Err(e) = self.git.cleanup_worktree(&task).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to clean up worktree");
            }
        }

        Ok(op)
    }

    /// CI wait and merge. Only cancellation is propagated; other failures
    /// end up in `result.merge_error`.
    async fn wait_for_ci(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        worktree: &Path,
        result: &mut FinalizeResult,
    ) -> Result<()> {
        match self
            .ci_merger
            .wait_for_ci_and_merge(cancel, task, worktree)
            .await
        {
            Ok(ci) => {
                result.ci_passed = ci.ci_passed;
                result.ci_details = ci.ci_details;
                result.ci_timed_out = ci.ci_timed_out;
                result.merged = ci.merged;
                result.merge_commit = ci.merge_commit;
                if let Some(error) = ci.error {
                    tracing::warn!(task_id = %task.id, error = %error, "CI wait/merge failed");
                    result.merge_error = Some(error);
                }
                if result.merged {
                    self.mark_pr_merged(&task.id).await;
                }
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(Error::Cancelled("during CI wait".to_string())),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "CI wait/merge failed");
                result.merge_error = Some(e.to_string());
                Ok(())
            }
        }
    }

    /// Records the merge on the task's PR state.
    async fn mark_pr_merged(&self, task_id: &str) {
        let mut task = match self.backend.load_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "failed to reload task after merge");
                return;
            }
        };
        let Some(pr) = task.pr.as_mut() else {
            return;
        };
        pr.status = PrStatus::Merged;
        pr.last_checked_at = Some(chrono::Utc::now());
        if let Err(e) = self.backend.save_task(&task).await {
            tracing::warn!(task_id, error = %e, "failed to persist merged PR status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_are_ordered() {
        let order = [
            checkpoint::LOADING,
            checkpoint::GIT_SETUP,
            checkpoint::EXECUTING,
            checkpoint::PHASE_RUNNING,
            checkpoint::PHASE_DONE_BEFORE_CI,
            checkpoint::CI_WAIT,
            checkpoint::DONE,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cancelled_token_fails_with_marker() {
        let token = CancellationToken::new();
        assert!(ensure_not_cancelled(&token, "before start").is_ok());

        token.cancel();
        let err = ensure_not_cancelled(&token, "before start").unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("cancelled"));
    }
}
