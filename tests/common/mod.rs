//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use task_finalizer::config::FinalizerConfig;
use task_finalizer::events::FinalizeProgress;
use task_finalizer::hosting::{CreatePrRequest, MergeMethod};
use task_finalizer::{
    Backend, CiMergeOutcome, CiMerger, DiffStat, Divergence, Error, EventBus, EventPayload,
    FinalizeService, GitService, HostingProvider, MemoryBackend, PhaseContext, PhaseExecutor,
    PhaseOutcome, PhaseProgress, PrStatus, PrStatusListener, PrStatusSummary, ProgressObserver,
    PullRequest, Result, Subscription, SyncOutcome, SyncStrategy, Task, TaskStatus,
};

/// Git double; `init_sync` fails when `fail_init` is set.
#[derive(Default)]
pub struct FakeGit {
    pub fail_init: bool,
    pub cleanups: AtomicUsize,
}

#[async_trait]
impl GitService for FakeGit {
    async fn init_sync(&self, task: &Task) -> Result<PathBuf> {
        if self.fail_init {
            return Err(Error::Git("worktree add failed".to_string()));
        }
        Ok(PathBuf::from("/tmp/worktrees").join(&task.id))
    }

    async fn divergence(&self, _worktree: &Path, _target: &str) -> Result<Divergence> {
        Ok(Divergence { ahead: 1, behind: 1 })
    }

    async fn head(&self, _worktree: &Path) -> Result<String> {
        Ok("abc123".to_string())
    }

    async fn sync_with_target(
        &self,
        _worktree: &Path,
        _target: &str,
        _strategy: SyncStrategy,
    ) -> Result<SyncOutcome> {
        Ok(SyncOutcome {
            head: "abc123".to_string(),
            updated: true,
            conflict_files: Vec::new(),
        })
    }

    async fn continue_sync(
        &self,
        worktree: &Path,
        strategy: SyncStrategy,
        _resolved: &[String],
    ) -> Result<SyncOutcome> {
        self.sync_with_target(worktree, "main", strategy).await
    }

    async fn abort_sync(&self, _worktree: &Path, _strategy: SyncStrategy) -> Result<()> {
        Ok(())
    }

    async fn diff_stat(&self, _worktree: &Path, _target: &str) -> Result<DiffStat> {
        Ok(DiffStat::default())
    }

    async fn push_branch(&self, _worktree: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn cleanup_worktree(&self, _task: &Task) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How the fake phase executor behaves.
pub enum ExecMode {
    Succeed,
    /// Succeeds with a scripted outcome.
    SucceedWith(PhaseOutcome),
    Fail(String),
    /// Waits for `release` or cancellation.
    Block(Arc<Notify>),
}

pub struct FakeExecutor {
    pub mode: ExecMode,
    pub calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(mode: ExecMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PhaseExecutor for FakeExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        _task: &Task,
        _phase: &str,
        _ctx: &PhaseContext,
        progress: &dyn ProgressObserver,
    ) -> Result<PhaseOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.on_progress(PhaseProgress::Running("Merging target branch".to_string()));

        match &self.mode {
            ExecMode::Succeed => {}
            ExecMode::SucceedWith(outcome) => {
                progress.on_progress(PhaseProgress::Completed);
                return Ok(outcome.clone());
            }
            ExecMode::Fail(message) => return Err(Error::Phase(message.clone())),
            ExecMode::Block(release) => {
                tokio::select! {
                    _ = release.notified() => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled("during phase execution".to_string()));
                    }
                }
            }
        }

        progress.on_progress(PhaseProgress::Completed);
        Ok(PhaseOutcome {
            commit_sha: Some("abc123".to_string()),
            synced: true,
            ..Default::default()
        })
    }
}

/// How the fake CI merger behaves.
pub enum CiMode {
    Outcome(CiMergeOutcome),
    Fail(String),
    WaitForCancel,
}

pub struct FakeCiMerger {
    pub mode: CiMode,
}

#[async_trait]
impl CiMerger for FakeCiMerger {
    async fn wait_for_ci_and_merge(
        &self,
        cancel: &CancellationToken,
        _task: &Task,
        _worktree: &Path,
    ) -> Result<CiMergeOutcome> {
        match &self.mode {
            CiMode::Outcome(outcome) => Ok(outcome.clone()),
            CiMode::Fail(message) => Err(Error::Ci(message.clone())),
            CiMode::WaitForCancel => {
                cancel.cancelled().await;
                Err(Error::Cancelled("waiting for CI".to_string()))
            }
        }
    }
}

/// Hosting double with a scripted PR and status summary.
#[derive(Default)]
pub struct FakeHosting {
    pub pr: Mutex<Option<PullRequest>>,
    pub summary: Mutex<PrStatusSummary>,
    pub lookups: AtomicUsize,
}

impl FakeHosting {
    pub fn with_pr(pr: PullRequest, summary: PrStatusSummary) -> Self {
        Self {
            pr: Mutex::new(Some(pr)),
            summary: Mutex::new(summary),
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HostingProvider for FakeHosting {
    async fn find_pr_by_branch(&self, _branch: &str) -> Result<Option<PullRequest>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.pr.lock().clone())
    }

    async fn get_pr_status_summary(&self, _pr: &PullRequest) -> Result<PrStatusSummary> {
        Ok(self.summary.lock().clone())
    }

    async fn create_pr(&self, _request: &CreatePrRequest) -> Result<PullRequest> {
        Err(Error::Hosting("not supported".to_string()))
    }

    async fn merge_pr(&self, _number: u64, _method: MergeMethod) -> Result<Option<String>> {
        Ok(None)
    }

    async fn create_pr_comment(&self, _number: u64, _body: &str) -> Result<()> {
        Ok(())
    }
}

/// Records every status change it is told about.
#[derive(Default)]
pub struct RecordingListener {
    pub changes: Mutex<Vec<(String, PrStatus, PrStatus)>>,
}

#[async_trait]
impl PrStatusListener for RecordingListener {
    async fn on_status_change(&self, task: &Task, old: PrStatus, new: PrStatus) {
        self.changes.lock().push((task.id.clone(), old, new));
    }
}

/// Service plus handles to its collaborators.
pub struct Harness {
    pub service: Arc<FinalizeService>,
    pub backend: Arc<MemoryBackend>,
    pub bus: Arc<EventBus>,
    pub git: Arc<FakeGit>,
    pub executor: Arc<FakeExecutor>,
}

pub struct HarnessBuilder {
    config: FinalizerConfig,
    tasks: Vec<Task>,
    git: FakeGit,
    exec: ExecMode,
    ci: CiMode,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: FinalizerConfig::default(),
            tasks: vec![completed_task("TASK-001")],
            git: FakeGit::default(),
            exec: ExecMode::Succeed,
            ci: CiMode::Outcome(CiMergeOutcome::default()),
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut FinalizerConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn failing_git(mut self) -> Self {
        self.git.fail_init = true;
        self
    }

    pub fn executor(mut self, mode: ExecMode) -> Self {
        self.exec = mode;
        self
    }

    pub fn ci(mut self, mode: CiMode) -> Self {
        self.ci = mode;
        self
    }

    pub fn build(self) -> Harness {
        let backend = Arc::new(MemoryBackend::with_tasks(self.tasks));
        let bus = Arc::new(EventBus::default());
        let git = Arc::new(self.git);
        let executor = Arc::new(FakeExecutor::new(self.exec));
        let service = Arc::new(FinalizeService::new(
            Arc::new(self.config),
            backend.clone(),
            bus.clone(),
            git.clone(),
            executor.clone(),
            Arc::new(FakeCiMerger { mode: self.ci }),
        ));
        Harness {
            service,
            backend,
            bus,
            git,
            executor,
        }
    }
}

impl Harness {
    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }
}

pub fn completed_task(id: &str) -> Task {
    Task::new(id, format!("orc/{}", id))
        .with_title("Add login page")
        .with_status(TaskStatus::Completed)
}

/// Receives finalize progress events until a terminal one arrives.
pub async fn wait_for_terminal(subscription: &mut Subscription) -> FinalizeProgress {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = subscription.recv().await.expect("subscription closed");
            if let EventPayload::FinalizeProgress(progress) = event.payload {
                if progress.status.is_terminal() {
                    return progress;
                }
            }
        }
    })
    .await
    .expect("finalize did not finish in time")
}

/// Drains every buffered finalize progress event.
pub fn drain_progress(subscription: &mut Subscription) -> Vec<FinalizeProgress> {
    let mut progress = Vec::new();
    while let Ok(event) = subscription.try_recv() {
        if let EventPayload::FinalizeProgress(p) = event.payload {
            progress.push(p);
        }
    }
    progress
}
