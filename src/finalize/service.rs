//! Finalize API: start, status, approval trigger and lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{
    FinalizeOperation, FinalizeRequest, FinalizeResponse, FinalizeStatus, FinalizeStatusView,
    FinalizeTracker, FinalizeWorkflow, OperationHandle, TryStart, ViewStatus,
};
use crate::backend::Backend;
use crate::config::FinalizerConfig;
use crate::error::{Error, Result};
use crate::events::Publisher;
use crate::executor::{CiMerger, PhaseExecutor};
use crate::git::GitService;
use crate::pr_poller::PrStatusListener;
use crate::task::{PhaseStatus, PrStatus, Task, TaskStatus};

/// Entry point for finalize requests.
pub struct FinalizeService {
    backend: Arc<dyn Backend>,
    tracker: Arc<FinalizeTracker>,
    workflow: Arc<FinalizeWorkflow>,
    config: Arc<FinalizerConfig>,
    root: CancellationToken,
    workers: Mutex<JoinSet<()>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizeService {
    pub fn new(
        config: Arc<FinalizerConfig>,
        backend: Arc<dyn Backend>,
        publisher: Arc<dyn Publisher>,
        git: Arc<dyn GitService>,
        executor: Arc<dyn PhaseExecutor>,
        ci_merger: Arc<dyn CiMerger>,
    ) -> Self {
        let workflow = FinalizeWorkflow::new(
            Arc::clone(&backend),
            git,
            executor,
            ci_merger,
            publisher,
            Arc::clone(&config),
        );
        Self {
            backend,
            tracker: Arc::new(FinalizeTracker::new()),
            workflow: Arc::new(workflow),
            config,
            root: CancellationToken::new(),
            workers: Mutex::new(JoinSet::new()),
            cleanup: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &Arc<FinalizeTracker> {
        &self.tracker
    }

    /// Token cancelled on shutdown; every workflow runs under a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Starts the periodic stale-operation cleanup.
    pub fn start_background(&self) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return;
        }
        *cleanup = Some(self.tracker.start_cleanup(
            self.root.child_token(),
            self.config.cleanup_interval(),
            self.config.retention(),
        ));
    }

    /// Starts finalizing a task, or reports the operation already running.
    ///
    /// Returns as soon as the operation is registered.
    pub async fn start_finalize(
        &self,
        task_id: &str,
        request: FinalizeRequest,
    ) -> Result<FinalizeResponse> {
        if self.root.is_cancelled() {
            return Err(Error::Cancelled("finalize service is shutting down".to_string()));
        }

        let task = self.backend.load_task(task_id).await?;
        if !request.force && !task.status.is_finalizable() {
            return Err(Error::Validation(format!(
                "task {} has status {:?}; finalize requires completed, planned or failed (use force to override)",
                task_id, task.status
            )));
        }
        if !request.gate_override && !self.config.should_run_finalize(task.weight) {
            return Err(Error::Validation(format!(
                "finalize is skipped for {:?} tasks (use gate_override to run it anyway)",
                task.weight
            )));
        }

        let mut op = FinalizeOperation::new(task_id);
        op.step = "Initializing".to_string();
        op.progress = "Finalize requested".to_string();

        match self.tracker.try_start(op) {
            TryStart::AlreadyActive(existing) => {
                let status = existing.status();
                tracing::debug!(task_id, status = ?status, "finalize already in progress");
                Ok(FinalizeResponse {
                    task_id: task_id.to_string(),
                    status,
                    message: "Finalize already in progress".to_string(),
                })
            }
            TryStart::Started(handle) => {
                tracing::info!(task_id, operation = %handle.id(), force = request.force, "finalize started");
                self.launch(handle)?;
                Ok(FinalizeResponse {
                    task_id: task_id.to_string(),
                    status: FinalizeStatus::Pending,
                    message: "Finalize started".to_string(),
                })
            }
        }
    }

    /// Spawns the workflow for a freshly registered operation, or fails the
    /// operation when shutdown has already begun.
    fn launch(&self, handle: OperationHandle) -> Result<()> {
        self.workflow.emit(&handle.snapshot());

        // Shutdown cancels the root before taking the worker set, so checking
        // under the lock guarantees every spawned worker is joined.
        let mut workers = self.workers.lock();
        if self.root.is_cancelled() {
            drop(workers);
            tracing::info!(task_id = %handle.task_id(), "finalize rejected during shutdown");
            let op = handle.fail("cancelled: finalize service is shutting down");
            self.workflow.emit(&op);
            return Err(Error::Cancelled("finalize service is shutting down".to_string()));
        }

        let token = self.root.child_token();
        let guard = self
            .tracker
            .set_cancel(handle.task_id(), handle.id(), token.clone());
        let workflow = Arc::clone(&self.workflow);

        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            let _guard = guard;
            workflow.run(token, handle).await;
        });
        Ok(())
    }

    /// Current finalize status of a task.
    ///
    /// Falls back to the persisted finalize phase when no operation is
    /// tracked, and to `NotStarted` when there is none either.
    pub async fn get_finalize_status(&self, task_id: &str) -> Result<FinalizeStatusView> {
        if let Some(handle) = self.tracker.get(task_id) {
            return Ok(handle.snapshot().into());
        }

        let task = self.backend.load_task(task_id).await?;
        let Some(phase) = task.finalize_phase() else {
            return Ok(FinalizeStatusView::not_started(task_id));
        };

        let mut view = FinalizeStatusView::not_started(task_id);
        view.started_at = phase.started_at;
        view.completed_at = phase.completed_at;
        view.updated_at = phase.completed_at.or(phase.started_at);
        view.commit_sha = phase.commit_sha.clone();
        view.error = phase.error.clone();

        match phase.status {
            PhaseStatus::Completed => {
                view.status = ViewStatus::Completed;
                view.step = "Complete".to_string();
                view.step_percent = 100;
            }
            PhaseStatus::Failed => {
                view.status = ViewStatus::Failed;
                view.step = "Failed".to_string();
            }
            PhaseStatus::Running => {
                let stale_after = self.config.stale_running_after();
                let stale = match phase.started_at {
                    Some(started) => {
                        (Utc::now() - started).to_std().unwrap_or_default() > stale_after
                    }
                    None => true,
                };
                if stale {
                    view.status = ViewStatus::Failed;
                    view.step = "Failed".to_string();
                    view.error = Some(
                        "interrupted: finalize was running when the process stopped".to_string(),
                    );
                } else {
                    view.status = ViewStatus::Running;
                    view.step = "Executing finalize".to_string();
                }
            }
            PhaseStatus::Pending => {
                view.status = ViewStatus::Pending;
            }
            PhaseStatus::Skipped => {
                view.status = ViewStatus::Skipped;
                view.step = "Skipped".to_string();
            }
        }
        Ok(view)
    }

    /// Starts finalize for an approved PR when auto-trigger applies.
    ///
    /// Returns whether a new operation was started. Ineligible tasks are
    /// skipped without error.
    pub async fn trigger_finalize_on_approval(&self, task_id: &str) -> Result<bool> {
        if !self.config.completion.auto_trigger_on_approval {
            tracing::debug!(task_id, "auto-trigger on approval disabled");
            return Ok(false);
        }
        if self.root.is_cancelled() {
            return Ok(false);
        }

        let task = self.backend.load_task(task_id).await?;
        if !self.config.should_run_finalize(task.weight) {
            tracing::debug!(task_id, weight = ?task.weight, "finalize not applicable for task weight");
            return Ok(false);
        }
        if task.status != TaskStatus::Completed {
            tracing::debug!(task_id, status = ?task.status, "task not completed, skipping auto-finalize");
            return Ok(false);
        }
        if task.finalize_phase().map(|p| p.status) == Some(PhaseStatus::Completed) {
            tracing::debug!(task_id, "finalize already completed");
            return Ok(false);
        }

        let mut op = FinalizeOperation::new(task_id);
        op.step = "Initializing".to_string();
        op.progress = "Auto-triggered on PR approval".to_string();

        match self.tracker.try_start(op) {
            TryStart::AlreadyActive(existing) => {
                tracing::debug!(task_id, status = ?existing.status(), "finalize already in progress");
                Ok(false)
            }
            TryStart::Started(handle) => {
                tracing::info!(task_id, operation = %handle.id(), "auto-triggering finalize on PR approval");
                self.launch(handle)?;
                Ok(true)
            }
        }
    }

    /// Cancels every operation and waits for workflows and cleanup to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.cancel_all();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "finalize workflow task panicked");
            }
        }

        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            if let Err(e) = cleanup.await {
                tracing::error!(error = %e, "finalize cleanup task panicked");
            }
        }
        tracing::info!("finalize service stopped");
    }
}

/// Starts finalize when a polled PR becomes approved.
pub struct ApprovalTrigger {
    service: Arc<FinalizeService>,
}

impl ApprovalTrigger {
    pub fn new(service: Arc<FinalizeService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl PrStatusListener for ApprovalTrigger {
    async fn on_status_change(&self, task: &Task, _old: PrStatus, new: PrStatus) {
        if new != PrStatus::Approved {
            return;
        }
        match self.service.trigger_finalize_on_approval(&task.id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(task_id = %task.id, "approval did not trigger finalize"),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to trigger finalize on approval")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use crate::backend::MemoryBackend;
    use crate::events::{EventBus, EventPayload};
    use crate::executor::{CiMergeOutcome, PhaseContext, PhaseOutcome, ProgressObserver};
    use crate::git::{Divergence, SyncOutcome, SyncStrategy};
    use crate::risk::DiffStat;

    struct NoGit;

    fn unavailable<T>() -> Result<T> {
        Err(Error::Git("git unavailable".to_string()))
    }

    #[async_trait]
    impl GitService for NoGit {
        async fn init_sync(&self, _task: &Task) -> Result<PathBuf> {
            unavailable()
        }
        async fn divergence(&self, _worktree: &Path, _target: &str) -> Result<Divergence> {
            unavailable()
        }
        async fn head(&self, _worktree: &Path) -> Result<String> {
            unavailable()
        }
        async fn sync_with_target(
            &self,
            _worktree: &Path,
            _target: &str,
            _strategy: SyncStrategy,
        ) -> Result<SyncOutcome> {
            unavailable()
        }
        async fn continue_sync(
            &self,
            _worktree: &Path,
            _strategy: SyncStrategy,
            _resolved: &[String],
        ) -> Result<SyncOutcome> {
            unavailable()
        }
        async fn abort_sync(&self, _worktree: &Path, _strategy: SyncStrategy) -> Result<()> {
            unavailable()
        }
        async fn diff_stat(&self, _worktree: &Path, _target: &str) -> Result<DiffStat> {
            unavailable()
        }
        async fn push_branch(&self, _worktree: &Path, _branch: &str) -> Result<()> {
            unavailable()
        }
        async fn cleanup_worktree(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl PhaseExecutor for NoopExecutor {
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _task: &Task,
            _phase: &str,
            _ctx: &PhaseContext,
            _progress: &dyn ProgressObserver,
        ) -> Result<PhaseOutcome> {
            Ok(PhaseOutcome::default())
        }
    }

    struct NoopCi;

    #[async_trait]
    impl CiMerger for NoopCi {
        async fn wait_for_ci_and_merge(
            &self,
            _cancel: &CancellationToken,
            _task: &Task,
            _worktree: &Path,
        ) -> Result<CiMergeOutcome> {
            Ok(CiMergeOutcome::default())
        }
    }

    fn service(bus: Arc<EventBus>) -> FinalizeService {
        FinalizeService::new(
            Arc::new(FinalizerConfig::default()),
            Arc::new(MemoryBackend::new()),
            bus,
            Arc::new(NoGit),
            Arc::new(NoopExecutor),
            Arc::new(NoopCi),
        )
    }

    #[tokio::test]
    async fn launch_after_shutdown_began_fails_without_spawning() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe("TASK-001");
        let service = service(bus);

        // An operation admitted just before shutdown cancelled the root.
        let TryStart::Started(handle) = service.tracker.try_start(FinalizeOperation::new("TASK-001"))
        else {
            panic!("operation not admitted");
        };
        service.root.cancel();

        let err = service.launch(handle).unwrap_err();
        assert!(err.is_cancelled());
        assert!(service.workers.lock().is_empty());
        assert_eq!(
            service.tracker.get("TASK-001").unwrap().status(),
            FinalizeStatus::Failed
        );

        let mut statuses = Vec::new();
        while let Ok(event) = sub.try_recv() {
            if let EventPayload::FinalizeProgress(progress) = event.payload {
                statuses.push(progress.status);
            }
        }
        assert_eq!(statuses, vec![FinalizeStatus::Pending, FinalizeStatus::Failed]);

        // Shutdown has nothing left to join.
        service.shutdown().await;
    }

    #[tokio::test]
    async fn launch_spawns_tracked_worker() {
        let service = service(Arc::new(EventBus::default()));
        let TryStart::Started(handle) = service.tracker.try_start(FinalizeOperation::new("TASK-001"))
        else {
            panic!("operation not admitted");
        };

        assert!(service.launch(handle).is_ok());
        assert_eq!(service.workers.lock().len(), 1);
        service.shutdown().await;
        assert!(service.workers.lock().is_empty());
    }
}
