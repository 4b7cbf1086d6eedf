//! Registry of in-flight finalize operations.
//!
//! At most one operation per task is active (pending or running) at a time.
//! Terminal operations stay visible for status queries until
//! [`FinalizeTracker::cleanup_stale`] reaps them.
//!
//! Lock order is always registry map first, then an operation's own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{FinalizeOperation, FinalizeResult, FinalizeStatus};

/// Shared, mutable view of one tracked operation.
///
/// Every mutation refreshes `updated_at` and returns a snapshot, so callers
/// can publish exactly the state they produced.
#[derive(Clone, Debug)]
pub struct OperationHandle {
    id: Uuid,
    task_id: String,
    op: Arc<Mutex<FinalizeOperation>>,
}

impl OperationHandle {
    pub fn new(op: FinalizeOperation) -> Self {
        Self {
            id: op.id,
            task_id: op.task_id.clone(),
            op: Arc::new(Mutex::new(op)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn snapshot(&self) -> FinalizeOperation {
        self.op.lock().clone()
    }

    pub fn status(&self) -> FinalizeStatus {
        self.op.lock().status
    }

    fn update(&self, f: impl FnOnce(&mut FinalizeOperation)) -> FinalizeOperation {
        let mut op = self.op.lock();
        if op.status.is_active() {
            f(&mut op);
            op.updated_at = Utc::now();
        }
        op.clone()
    }

    /// Moves to a new checkpoint and marks the operation running.
    ///
    /// `step_percent` never decreases.
    pub fn checkpoint(
        &self,
        step: impl Into<String>,
        progress: impl Into<String>,
        percent: u8,
    ) -> FinalizeOperation {
        self.update(|op| {
            op.status = FinalizeStatus::Running;
            op.step = step.into();
            op.progress = progress.into();
            op.step_percent = op.step_percent.max(percent.min(100));
        })
    }

    /// Raises `step_percent` without changing the step label.
    pub fn advance(&self, percent: u8) -> FinalizeOperation {
        self.update(|op| op.step_percent = op.step_percent.max(percent.min(100)))
    }

    /// Updates the progress text within the current step, raising the percentage.
    pub fn report(&self, progress: impl Into<String>, percent: u8) -> FinalizeOperation {
        self.update(|op| {
            op.progress = progress.into();
            op.step_percent = op.step_percent.max(percent.min(100));
        })
    }

    /// Completes the operation at 100% with its result.
    pub fn complete(
        &self,
        step: impl Into<String>,
        progress: impl Into<String>,
        result: FinalizeResult,
    ) -> FinalizeOperation {
        self.update(|op| {
            op.status = FinalizeStatus::Completed;
            op.step = step.into();
            op.progress = progress.into();
            op.step_percent = 100;
            op.result = Some(result);
        })
    }

    /// Fails the operation; the percentage stays where it stopped.
    pub fn fail(&self, error: impl Into<String>) -> FinalizeOperation {
        self.update(|op| {
            op.status = FinalizeStatus::Failed;
            op.step = "Failed".to_string();
            op.progress = String::new();
            op.error = Some(error.into());
        })
    }
}

/// Outcome of [`FinalizeTracker::try_start`].
#[derive(Debug)]
pub enum TryStart {
    /// The new operation was registered.
    Started(OperationHandle),
    /// Another operation is already active for the task.
    AlreadyActive(OperationHandle),
}

struct CancelEntry {
    op_id: Uuid,
    token: CancellationToken,
}

/// Concurrency-safe per-task registry of finalize operations.
#[derive(Default)]
pub struct FinalizeTracker {
    ops: Mutex<HashMap<String, OperationHandle>>,
    cancels: Mutex<HashMap<String, CancelEntry>>,
}

impl FinalizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `op` unless the task already has an active operation.
    ///
    /// A terminal operation for the same task is replaced.
    pub fn try_start(&self, op: FinalizeOperation) -> TryStart {
        let mut ops = self.ops.lock();
        if let Some(existing) = ops.get(&op.task_id) {
            if existing.status().is_active() {
                return TryStart::AlreadyActive(existing.clone());
            }
        }
        let handle = OperationHandle::new(op);
        ops.insert(handle.task_id.clone(), handle.clone());
        TryStart::Started(handle)
    }

    pub fn get(&self, task_id: &str) -> Option<OperationHandle> {
        self.ops.lock().get(task_id).cloned()
    }

    /// Number of tracked operations, terminal ones included.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.ops
            .lock()
            .values()
            .filter(|h| h.status().is_active())
            .count()
    }

    /// Associates the cancellation token of operation `op_id` with the task.
    ///
    /// The returned guard releases the token when dropped.
    pub fn set_cancel(
        self: &Arc<Self>,
        task_id: &str,
        op_id: Uuid,
        token: CancellationToken,
    ) -> CancelGuard {
        self.cancels
            .lock()
            .insert(task_id.to_string(), CancelEntry { op_id, token });
        CancelGuard {
            tracker: Arc::clone(self),
            task_id: task_id.to_string(),
            op_id,
        }
    }

    /// Cancels the task's running operation. Returns false if none is registered.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.cancels.lock().remove(task_id) {
            Some(entry) => {
                entry.token.cancel();
                tracing::info!(task_id, operation = %entry.op_id, "finalize cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every registered operation, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<(String, CancelEntry)> = self.cancels.lock().drain().collect();
        for (_, entry) in &entries {
            entry.token.cancel();
        }
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "cancelled all finalize operations");
        }
        entries.len()
    }

    fn release(&self, task_id: &str, op_id: Uuid) {
        let mut cancels = self.cancels.lock();
        if cancels.get(task_id).map(|e| e.op_id) == Some(op_id) {
            if let Some(entry) = cancels.remove(task_id) {
                entry.token.cancel();
            }
        }
    }

    /// Removes terminal operations not updated within `retention`.
    pub fn cleanup_stale(&self, retention: Duration) -> usize {
        self.cleanup_stale_at(Utc::now(), retention)
    }

    pub(crate) fn cleanup_stale_at(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut ops = self.ops.lock();
        let before = ops.len();
        ops.retain(|_, handle| {
            let op = handle.op.lock();
            if op.status.is_active() {
                return true;
            }
            let age = (now - op.updated_at).to_std().unwrap_or_default();
            age <= retention
        });
        let removed = before - ops.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned up stale finalize operations");
        }
        removed
    }

    /// Runs [`cleanup_stale`](Self::cleanup_stale) every `interval` until
    /// `token` is cancelled.
    pub fn start_cleanup(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        retention: Duration,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        tracker.cleanup_stale(retention);
                    }
                }
            }
        })
    }
}

/// Releases an operation's cancellation token when the workflow task exits.
///
/// Only releases the token if it still belongs to the same operation, so a
/// late-exiting run cannot drop the token of a newer one.
pub struct CancelGuard {
    tracker: Arc<FinalizeTracker>,
    task_id: String,
    op_id: Uuid,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.task_id, self.op_id);
    }
}
