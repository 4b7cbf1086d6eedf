//! Background reconciliation of task PR state with the hosting provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::PrPollerConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventPayload, Publisher};
use crate::hosting::HostingProvider;
use crate::pr_status::resolve_pr_status;
use crate::task::{PrStatus, Task};

/// Default interval between polling passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default minimum age of `last_checked_at` before a PR is polled again.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);

/// Notified when a poll changes a task's PR status.
#[async_trait]
pub trait PrStatusListener: Send + Sync {
    async fn on_status_change(&self, task: &Task, old: PrStatus, new: PrStatus);
}

/// Sends `true` on drop so waiters see the loop exit however it ends.
struct DoneSignal(watch::Sender<bool>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

/// Polls PRs of tracked tasks on a fixed interval.
pub struct PrPoller {
    backend: Arc<dyn Backend>,
    hosting: Arc<dyn HostingProvider>,
    publisher: Option<Arc<dyn Publisher>>,
    listener: Option<Arc<dyn PrStatusListener>>,
    interval: Duration,
    debounce: Duration,
    stop: CancellationToken,
    done: Mutex<Option<watch::Receiver<bool>>>,
    // Per-task locks so the loop and on-demand polls of one task see a
    // consistent old status while other tasks poll freely.
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PrPoller {
    pub fn new(
        backend: Arc<dyn Backend>,
        hosting: Arc<dyn HostingProvider>,
        config: &PrPollerConfig,
    ) -> Self {
        let interval = match config.interval_secs {
            0 => DEFAULT_POLL_INTERVAL,
            secs => Duration::from_secs(secs),
        };
        Self {
            backend,
            hosting,
            publisher: None,
            listener: None,
            interval,
            debounce: Duration::from_secs(config.debounce_secs),
            stop: CancellationToken::new(),
            done: Mutex::new(None),
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes a `TaskUpdated` event whenever a PR status changes.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PrStatusListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// True if the task has a PR that is still open and not checked recently.
    pub fn should_poll(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let Some(pr) = task.pr.as_ref() else {
            return false;
        };
        if pr.url.is_empty() || pr.status.is_final() {
            return false;
        }
        match pr.last_checked_at {
            None => true,
            Some(checked) => (now - checked).to_std().unwrap_or_default() >= self.debounce,
        }
    }

    /// Starts the polling loop: one pass immediately, then one per interval.
    ///
    /// The loop ends on [`stop`](Self::stop) or when `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut done = self.done.lock();
        if done.is_some() {
            tracing::warn!("PR poller already started");
            return;
        }
        let (tx, rx) = watch::channel(false);
        *done = Some(rx);

        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let _done = DoneSignal(tx);
            poller.run(shutdown).await;
        });
        tracing::info!(interval = ?self.interval, "PR poller started");
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Not raced against the stop signal: a poll that already saved a
            // new status must also notify, so the pass checks between tasks.
            self.poll_due(&shutdown).await;
        }
        tracing::info!("PR poller stopped");
    }

    /// Stops the loop and waits for it to exit. Safe to call repeatedly and
    /// from several tasks at once; every caller returns after the exit.
    pub async fn stop(&self) {
        self.stop.cancel();
        let done = self.done.lock().clone();
        if let Some(mut rx) = done {
            // An error means the sender is gone, so the loop already exited.
            let _ = rx.wait_for(|exited| *exited).await;
        }
    }

    /// Polls every task that is due.
    pub async fn poll_all(&self) {
        self.poll_due(&self.stop).await;
    }

    async fn poll_due(&self, shutdown: &CancellationToken) {
        let tasks = match self.backend.load_all_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load tasks for PR polling");
                return;
            }
        };

        let now = Utc::now();
        for task in tasks.iter().filter(|t| self.should_poll(t, now)) {
            if self.stop.is_cancelled() || shutdown.is_cancelled() {
                tracing::debug!("PR polling pass interrupted by shutdown");
                return;
            }
            if let Err(e) = self.poll_task(task).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to poll PR status");
            }
        }
    }

    /// Polls on demand, bypassing the debounce.
    pub async fn poll_task_by_id(&self, task_id: &str) -> Result<PrStatus> {
        let task = self.backend.load_task(task_id).await?;
        if task.pr_url().is_none() {
            return Err(Error::Validation(format!("task {} has no pull request", task_id)));
        }
        self.poll_task(&task).await
    }

    /// Refreshes one task's PR state and persists it.
    ///
    /// A PR that can no longer be found is recorded as closed. The listener
    /// is invoked when the stored status changes.
    pub async fn poll_task(&self, task: &Task) -> Result<PrStatus> {
        let lock = self.task_lock(&task.id);
        let _guard = lock.lock().await;

        // Reload so the previous status reflects any poll that just finished.
        let mut task = self.backend.load_task(&task.id).await?;
        let old = task.pr_status();
        let now = Utc::now();

        let found = self.hosting.find_pr_by_branch(&task.branch).await?;
        let summary = match &found {
            Some(pr) => Some(self.hosting.get_pr_status_summary(pr).await?),
            None => None,
        };

        let info = task.pr.get_or_insert_with(Default::default);
        let new = match (found, summary) {
            (Some(pr), Some(summary)) => {
                let status = resolve_pr_status(&pr, &summary);
                if !pr.url.is_empty() {
                    info.url = pr.url;
                }
                info.number = pr.number;
                info.status = status;
                info.checks_status = Some(summary.checks_status.to_string());
                info.mergeable = summary.mergeable;
                info.review_count = summary.review_count;
                info.approval_count = summary.approval_count;
                status
            }
            _ => {
                tracing::info!(task_id = %task.id, branch = %task.branch, "PR not found, marking closed");
                info.status = PrStatus::Closed;
                PrStatus::Closed
            }
        };
        info.last_checked_at = Some(now);

        self.backend.save_task(&task).await?;

        if new != old {
            tracing::info!(task_id = %task.id, old = %old, new = %new, "PR status changed");
            if let Some(publisher) = &self.publisher {
                publisher.publish(Event::new(task.id.clone(), EventPayload::TaskUpdated));
            }
            if let Some(listener) = &self.listener {
                listener.on_status_change(&task, old, new).await;
            }
        }
        Ok(new)
    }

    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.task_locks.lock();
        // Drop locks nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }
}
