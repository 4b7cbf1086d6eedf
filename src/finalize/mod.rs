//! Finalize orchestration: one supervised async operation per task.
//!
//! [`FinalizeService`] is the entry point. It admits requests through the
//! [`FinalizeTracker`], runs a [`FinalizeWorkflow`] on a tokio task, and
//! answers status queries from the tracker or from persisted phase state.

pub mod service;
pub mod tracker;
pub mod workflow;

pub use service::{ApprovalTrigger, FinalizeService};
pub use tracker::{CancelGuard, FinalizeTracker, OperationHandle, TryStart};
pub use workflow::FinalizeWorkflow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::FinalizeProgress;
use crate::risk::RiskLevel;

/// Status of a finalize operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FinalizeStatus {
    /// Pending and running operations block a new start for the same task.
    pub fn is_active(self) -> bool {
        matches!(self, FinalizeStatus::Pending | FinalizeStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Outcome of a completed finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FinalizeResult {
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub target_branch: String,
    /// Number of files whose sync conflicts were resolved.
    #[serde(default)]
    pub conflicts_resolved: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub files_changed: u32,
    #[serde(default)]
    pub lines_changed: u32,
    /// The change reached the configured re-review threshold.
    #[serde(default)]
    pub needs_review: bool,
    pub ci_passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ci_details: String,
    pub ci_timed_out: bool,
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    /// Set when CI wait or merge failed after a successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_error: Option<String>,
}

/// One finalize run of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeOperation {
    pub id: Uuid,
    pub task_id: String,
    pub status: FinalizeStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub step: String,
    pub progress: String,
    pub step_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FinalizeOperation {
    /// A new pending operation at 0%.
    pub fn new(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            status: FinalizeStatus::Pending,
            started_at: now,
            updated_at: now,
            step: "Pending".to_string(),
            progress: "Waiting to start".to_string(),
            step_percent: 0,
            result: None,
            error: None,
        }
    }

    pub fn to_progress(&self) -> FinalizeProgress {
        FinalizeProgress {
            status: self.status,
            step: self.step.clone(),
            progress: self.progress.clone(),
            step_percent: self.step_percent,
            updated_at: self.updated_at,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Options of a finalize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FinalizeRequest {
    /// Allow finalizing a task whose status is not finalizable.
    #[serde(default)]
    pub force: bool,
    /// Finalize even if the task's weight skips the finalize phase.
    #[serde(default)]
    pub gate_override: bool,
}

/// Answer to a finalize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub task_id: String,
    pub status: FinalizeStatus,
    pub message: String,
}

/// Finalize status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    NotStarted,
    Pending,
    Running,
    Completed,
    Failed,
    /// The task's pipeline recorded the finalize phase as skipped.
    Skipped,
}

impl From<FinalizeStatus> for ViewStatus {
    fn from(status: FinalizeStatus) -> Self {
        match status {
            FinalizeStatus::Pending => ViewStatus::Pending,
            FinalizeStatus::Running => ViewStatus::Running,
            FinalizeStatus::Completed => ViewStatus::Completed,
            FinalizeStatus::Failed => ViewStatus::Failed,
        }
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeStatusView {
    pub task_id: String,
    pub status: ViewStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
    pub step_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FinalizeStatusView {
    pub fn not_started(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ViewStatus::NotStarted,
            step: String::new(),
            progress: String::new(),
            step_percent: 0,
            started_at: None,
            updated_at: None,
            completed_at: None,
            commit_sha: None,
            result: None,
            error: None,
        }
    }
}

impl From<FinalizeOperation> for FinalizeStatusView {
    fn from(op: FinalizeOperation) -> Self {
        let completed_at = op.status.is_terminal().then_some(op.updated_at);
        let commit_sha = op.result.as_ref().and_then(|r| r.commit_sha.clone());
        Self {
            task_id: op.task_id,
            status: op.status.into(),
            step: op.step,
            progress: op.progress,
            step_percent: op.step_percent,
            started_at: Some(op.started_at),
            updated_at: Some(op.updated_at),
            completed_at,
            commit_sha,
            result: op.result,
            error: op.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        assert!(FinalizeStatus::Pending.is_active());
        assert!(FinalizeStatus::Running.is_active());
        assert!(FinalizeStatus::Completed.is_terminal());
        assert!(FinalizeStatus::Failed.is_terminal());
    }

    #[test]
    fn new_operation_is_pending_at_zero() {
        let op = FinalizeOperation::new("TASK-001");
        assert_eq!(op.status, FinalizeStatus::Pending);
        assert_eq!(op.step_percent, 0);
        assert!(op.result.is_none());
    }

    #[test]
    fn view_serializes_not_started() {
        let view = FinalizeStatusView::not_started("TASK-001");
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "not_started");
        assert!(json.get("result").is_none());
    }
}
