//! Configuration for finalize orchestration.
//!
//! Loaded from TOML and validated before use to catch errors early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::git::SyncStrategy;
use crate::risk::RiskLevel;
use crate::task::TaskWeight;

/// Completion policy: target branch, CI wait and merge behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Branch the work branch is synced with and merged into.
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    /// Wait for CI after a successful sync.
    #[serde(default)]
    pub wait_for_ci: bool,
    /// Merge the PR once CI passes.
    #[serde(default = "default_true")]
    pub merge_on_ci_pass: bool,
    /// Maximum time to wait for CI checks.
    #[serde(default = "default_ci_timeout_secs")]
    pub ci_timeout_secs: u64,
    /// First CI poll interval.
    #[serde(default = "default_ci_poll_initial_secs")]
    pub ci_poll_initial_secs: u64,
    /// CI poll interval cap.
    #[serde(default = "default_ci_poll_max_secs")]
    pub ci_poll_max_secs: u64,
    /// Start finalize automatically when a PR becomes approved.
    #[serde(default)]
    pub auto_trigger_on_approval: bool,
    /// Run finalize for trivial tasks as well.
    #[serde(default)]
    pub finalize_trivial: bool,
    /// Command run in the worktree after syncing, e.g. `cargo test`.
    #[serde(default)]
    pub test_command: Option<String>,
    /// Merge the target into the branch, or rebase the branch onto it.
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    /// Command run in the worktree to resolve sync conflicts. Without one,
    /// any conflict fails the finalize.
    #[serde(default)]
    pub conflict_command: Option<String>,
    #[serde(default)]
    pub risk_assessment: RiskAssessmentConfig,
}

/// Risk classification of the synced branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lowest level that flags the change for another review.
    #[serde(default = "default_re_review_threshold")]
    pub re_review_threshold: RiskLevel,
}

fn default_re_review_threshold() -> RiskLevel {
    RiskLevel::High
}

impl Default for RiskAssessmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            re_review_threshold: default_re_review_threshold(),
        }
    }
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ci_timeout_secs() -> u64 {
    30 * 60
}

fn default_ci_poll_initial_secs() -> u64 {
    30
}

fn default_ci_poll_max_secs() -> u64 {
    120
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            target_branch: default_target_branch(),
            wait_for_ci: false,
            merge_on_ci_pass: true,
            ci_timeout_secs: default_ci_timeout_secs(),
            ci_poll_initial_secs: default_ci_poll_initial_secs(),
            ci_poll_max_secs: default_ci_poll_max_secs(),
            auto_trigger_on_approval: false,
            finalize_trivial: false,
            test_command: None,
            sync_strategy: SyncStrategy::default(),
            conflict_command: None,
            risk_assessment: RiskAssessmentConfig::default(),
        }
    }
}

/// Worktree placement and cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorktreeConfig {
    /// Directory holding task worktrees. Defaults to `.finalizer/worktrees` in the repo.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Remove the task worktree after a completed finalize.
    #[serde(default)]
    pub cleanup_on_complete: bool,
}

/// PR poller timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrPollerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    /// Minimum age of `last_checked_at` before a task is polled again.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_debounce_secs() -> u64 {
    30
}

impl Default for PrPollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            debounce_secs: default_debounce_secs(),
        }
    }
}

/// Finalize tracker housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// How long terminal operations stay queryable in memory.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Age after which a persisted running finalize with no live operation
    /// is reported as interrupted.
    #[serde(default = "default_stale_running_after_secs")]
    pub stale_running_after_secs: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_retention_secs() -> u64 {
    30 * 60
}

fn default_stale_running_after_secs() -> u64 {
    60 * 60
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_secs: default_retention_secs(),
            stale_running_after_secs: default_stale_running_after_secs(),
        }
    }
}

/// Event bus and stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber channel capacity.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_buffer_size() -> usize {
    256
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FinalizerConfig {
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub pr_poller: PrPollerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl FinalizerConfig {
    /// Parses configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        for warning in config.validate().into_result()? {
            tracing::warn!(path = ?path, warning = %warning, "config warning");
        }
        Ok(config)
    }

    /// Whether finalize applies to a task of the given weight.
    pub fn should_run_finalize(&self, weight: TaskWeight) -> bool {
        weight != TaskWeight::Trivial || self.completion.finalize_trivial
    }

    pub fn should_wait_for_ci(&self) -> bool {
        self.completion.wait_for_ci
    }

    pub fn should_merge_on_ci_pass(&self) -> bool {
        self.completion.merge_on_ci_pass
    }

    pub fn ci_timeout(&self) -> Duration {
        Duration::from_secs(self.completion.ci_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.pr_poller.interval_secs)
    }

    pub fn poll_debounce(&self) -> Duration {
        Duration::from_secs(self.pr_poller.debounce_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.cleanup_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.tracker.retention_secs)
    }

    pub fn stale_running_after(&self) -> Duration {
        Duration::from_secs(self.tracker.stale_running_after_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.events.heartbeat_interval_secs)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for FinalizerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.completion.target_branch.trim().is_empty() {
            result.add_error("completion.target_branch cannot be empty");
        }

        if self.completion.ci_poll_initial_secs == 0 {
            result.add_error("completion.ci_poll_initial_secs must be at least 1");
        }

        if self.completion.ci_poll_max_secs < self.completion.ci_poll_initial_secs {
            result.add_error("completion.ci_poll_max_secs must not be below ci_poll_initial_secs");
        }

        if self.completion.wait_for_ci && self.completion.ci_timeout_secs == 0 {
            result.add_error("completion.ci_timeout_secs must be positive when wait_for_ci is set");
        }

        if self.completion.risk_assessment.enabled
            && self.completion.risk_assessment.re_review_threshold == RiskLevel::Unknown
        {
            result.add_error("completion.risk_assessment.re_review_threshold cannot be unknown");
        }

        if self.pr_poller.interval_secs == 0 {
            result.add_error("pr_poller.interval_secs must be at least 1");
        }

        if self.pr_poller.interval_secs < 10 {
            result.add_warning("pr_poller.interval_secs below 10 may exhaust hosting API rate limits");
        }

        if self.tracker.cleanup_interval_secs == 0 {
            result.add_error("tracker.cleanup_interval_secs must be at least 1");
        }

        if self.events.buffer_size == 0 {
            result.add_error("events.buffer_size must be at least 1");
        }

        if self.events.heartbeat_interval_secs == 0 {
            result.add_error("events.heartbeat_interval_secs must be at least 1");
        }

        if self.completion.auto_trigger_on_approval && !self.completion.wait_for_ci {
            result.add_warning(
                "auto_trigger_on_approval without wait_for_ci syncs the branch but never merges",
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FinalizerConfig::default();
        let result = config.validate();

        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert_eq!(config.completion.target_branch, "main");
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.poll_debounce(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
[completion]
target_branch = "develop"
wait_for_ci = true

[pr_poller]
interval_secs = 120
"#;
        let config = FinalizerConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.completion.target_branch, "develop");
        assert!(config.should_wait_for_ci());
        assert!(config.should_merge_on_ci_pass());
        assert_eq!(config.pr_poller.interval_secs, 120);
        assert_eq!(config.pr_poller.debounce_secs, 30);
        assert_eq!(config.tracker.retention_secs, 30 * 60);
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = FinalizerConfig::from_toml_str("completion = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_target_branch_is_an_error() {
        let mut config = FinalizerConfig::default();
        config.completion.target_branch = "  ".to_string();

        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.into_result().is_err());
    }

    #[test]
    fn auto_trigger_without_ci_warns() {
        let mut config = FinalizerConfig::default();
        config.completion.auto_trigger_on_approval = true;

        let warnings = config.validate().into_result().unwrap();
        assert!(warnings.iter().any(|w| w.contains("never merges")));
    }

    #[test]
    fn parses_sync_and_risk_settings() {
        let toml = r#"
[completion]
sync_strategy = "rebase"
conflict_command = "resolve-conflicts"

[completion.risk_assessment]
re_review_threshold = "medium"
"#;
        let config = FinalizerConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.completion.sync_strategy, SyncStrategy::Rebase);
        assert_eq!(
            config.completion.conflict_command.as_deref(),
            Some("resolve-conflicts")
        );
        assert!(config.completion.risk_assessment.enabled);
        assert_eq!(
            config.completion.risk_assessment.re_review_threshold,
            RiskLevel::Medium
        );

        let defaults = FinalizerConfig::default();
        assert_eq!(defaults.completion.sync_strategy, SyncStrategy::Merge);
        assert_eq!(
            defaults.completion.risk_assessment.re_review_threshold,
            RiskLevel::High
        );
    }

    #[test]
    fn unknown_review_threshold_is_an_error() {
        let mut config = FinalizerConfig::default();
        config.completion.risk_assessment.re_review_threshold = RiskLevel::Unknown;
        assert!(!config.validate().is_valid());

        config.completion.risk_assessment.enabled = false;
        assert!(config.validate().is_valid());
    }

    #[test]
    fn trivial_weight_skips_finalize_by_default() {
        let mut config = FinalizerConfig::default();
        assert!(!config.should_run_finalize(TaskWeight::Trivial));
        assert!(config.should_run_finalize(TaskWeight::Small));

        config.completion.finalize_trivial = true;
        assert!(config.should_run_finalize(TaskWeight::Trivial));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("finalizer.toml");
        std::fs::write(&path, "[worktree]\ncleanup_on_complete = true\n").unwrap();

        let config = FinalizerConfig::load(&path).unwrap();
        assert!(config.worktree.cleanup_on_complete);
    }
}
