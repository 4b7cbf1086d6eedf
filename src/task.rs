//! Persisted task model shared by the finalize workflow and the PR poller.
//!
//! The task record is owned by the [`Backend`](crate::backend::Backend); this
//! crate only reads it and writes back whole records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase identifier used for finalize state in [`ExecutionState`].
pub const FINALIZE_PHASE: &str = "finalize";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Planned,
    Running,
    Paused,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Statuses that may be finalized without `force`.
    pub fn is_finalizable(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Planned | TaskStatus::Failed
        )
    }
}

/// Size class of a task, used to gate which phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskWeight {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
}

/// Status of one phase in a task's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Persisted state of a single phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-phase execution state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionState {
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
}

impl ExecutionState {
    /// Returns the state of the given phase, if recorded.
    pub fn phase(&self, phase: &str) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    /// Marks a phase as running, clearing any previous outcome.
    pub fn start_phase(&mut self, phase: &str) {
        let state = self.phases.entry(phase.to_string()).or_default();
        state.status = PhaseStatus::Running;
        state.started_at = Some(Utc::now());
        state.completed_at = None;
        state.error = None;
    }

    /// Marks a phase as completed with an optional resulting commit.
    pub fn complete_phase(&mut self, phase: &str, commit_sha: Option<String>) {
        let state = self.phases.entry(phase.to_string()).or_default();
        state.status = PhaseStatus::Completed;
        state.completed_at = Some(Utc::now());
        state.commit_sha = commit_sha;
        state.error = None;
    }

    /// Marks a phase as failed with the given error text.
    pub fn fail_phase(&mut self, phase: &str, error: impl Into<String>) {
        let state = self.phases.entry(phase.to_string()).or_default();
        state.status = PhaseStatus::Failed;
        state.completed_at = Some(Utc::now());
        state.error = Some(error.into());
    }
}

/// Canonical status of a task's pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    #[default]
    None,
    Draft,
    PendingReview,
    ChangesRequested,
    Approved,
    Merged,
    Closed,
}

impl PrStatus {
    /// Merged and closed PRs are never polled again.
    pub fn is_final(self) -> bool {
        matches!(self, PrStatus::Merged | PrStatus::Closed)
    }
}

impl std::fmt::Display for PrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrStatus::None => "none",
            PrStatus::Draft => "draft",
            PrStatus::PendingReview => "pending_review",
            PrStatus::ChangesRequested => "changes_requested",
            PrStatus::Approved => "approved",
            PrStatus::Merged => "merged",
            PrStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Pull request state stored on the task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub status: PrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks_status: Option<String>,
    #[serde(default)]
    pub mergeable: bool,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default)]
    pub approval_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// A persisted task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub weight: TaskWeight,
    /// Work branch the task's changes live on.
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrInfo>,
    #[serde(default)]
    pub execution: ExecutionState,
}

impl Task {
    /// Creates a task in the `Created` state on the given branch.
    pub fn new(id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            status: TaskStatus::Created,
            weight: TaskWeight::default(),
            branch: branch.into(),
            initiative_id: None,
            pr: None,
            execution: ExecutionState::default(),
        }
    }

    /// Sets the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the weight.
    pub fn with_weight(mut self, weight: TaskWeight) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the initiative the task belongs to.
    pub fn with_initiative(mut self, initiative_id: impl Into<String>) -> Self {
        self.initiative_id = Some(initiative_id.into());
        self
    }

    /// Attaches PR state.
    pub fn with_pr(mut self, pr: PrInfo) -> Self {
        self.pr = Some(pr);
        self
    }

    /// Returns the PR URL if the task has a non-empty one.
    pub fn pr_url(&self) -> Option<&str> {
        self.pr
            .as_ref()
            .map(|pr| pr.url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// Returns the stored canonical PR status (`None` without a PR).
    pub fn pr_status(&self) -> PrStatus {
        self.pr.as_ref().map(|pr| pr.status).unwrap_or_default()
    }

    /// Returns the persisted finalize phase state.
    pub fn finalize_phase(&self) -> Option<&PhaseState> {
        self.execution.phase(FINALIZE_PHASE)
    }
}
