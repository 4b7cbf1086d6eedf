//! Hosting provider access: pull request lookup, review summary, merge.
//!
//! [`GhCliProvider`] drives the GitHub CLI with `--json` output.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Lifecycle state of a pull request on the hosting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    #[default]
    Open,
    Closed,
    Merged,
}

/// A pull request as reported by the hosting provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub state: PrState,
    pub draft: bool,
    pub head_branch: String,
    pub base_branch: String,
    pub mergeable: bool,
}

/// Aggregate review decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    PendingReview,
    Approved,
    ChangesRequested,
}

/// Aggregate state of CI checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChecksStatus {
    #[default]
    Unknown,
    None,
    Pending,
    Success,
    Failure,
}

impl fmt::Display for ChecksStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChecksStatus::Unknown => "unknown",
            ChecksStatus::None => "none",
            ChecksStatus::Pending => "pending",
            ChecksStatus::Success => "success",
            ChecksStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Review and checks summary for a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrStatusSummary {
    pub review_status: ReviewStatus,
    pub checks_status: ChecksStatus,
    pub mergeable: bool,
    /// Distinct reviewers with a deciding review.
    pub review_count: u32,
    pub approval_count: u32,
    /// Names of completed checks that did not pass.
    pub failed_checks: Vec<String>,
}

/// One submitted review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub author: String,
    /// Provider review state, e.g. `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`.
    pub state: String,
}

/// One CI check, normalized to lowercase provider terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub name: String,
    /// `completed` or an in-progress state such as `queued`.
    pub status: String,
    /// Set once completed: `success`, `failure`, `skipped`, ...
    pub conclusion: Option<String>,
}

impl CheckRun {
    /// True for a completed check whose conclusion counts as a failure.
    pub fn is_failed(&self) -> bool {
        self.status == "completed"
            && matches!(
                self.conclusion.as_deref(),
                Some("failure" | "timed_out" | "cancelled" | "action_required" | "error")
            )
    }
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePrRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

/// How a pull request is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeMethod {
    fn as_flag(self) -> &'static str {
        match self {
            MergeMethod::Squash => "--squash",
            MergeMethod::Merge => "--merge",
            MergeMethod::Rebase => "--rebase",
        }
    }
}

/// Hosting provider client.
#[async_trait]
pub trait HostingProvider: Send + Sync {
    /// Finds the most recent pull request whose head is `branch`.
    async fn find_pr_by_branch(&self, branch: &str) -> Result<Option<PullRequest>>;

    async fn get_pr_status_summary(&self, pr: &PullRequest) -> Result<PrStatusSummary>;

    async fn create_pr(&self, request: &CreatePrRequest) -> Result<PullRequest>;

    /// Merges a pull request, returning the merge commit when known.
    async fn merge_pr(&self, number: u64, method: MergeMethod) -> Result<Option<String>>;

    async fn create_pr_comment(&self, number: u64, body: &str) -> Result<()>;
}

/// Summarizes reviews using the latest deciding review of each author.
///
/// Comment-only and pending reviews are ignored. Any outstanding change
/// request wins over approvals.
pub fn summarize_reviews(reviews: &[Review]) -> (ReviewStatus, u32, u32) {
    let mut latest: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for review in reviews {
        if review.state == "COMMENTED" || review.state == "PENDING" {
            continue;
        }
        latest.insert(review.author.as_str(), review.state.as_str());
    }

    let approvals = latest.values().filter(|s| **s == "APPROVED").count() as u32;
    let changes_requested = latest
        .values()
        .filter(|s| **s == "CHANGES_REQUESTED")
        .count();

    let status = if changes_requested > 0 {
        ReviewStatus::ChangesRequested
    } else if approvals > 0 {
        ReviewStatus::Approved
    } else {
        ReviewStatus::PendingReview
    };
    (status, latest.len() as u32, approvals)
}

/// Summarizes CI checks: any failure fails, then any pending is pending.
pub fn summarize_checks(checks: &[CheckRun]) -> ChecksStatus {
    if checks.is_empty() {
        return ChecksStatus::None;
    }

    let failed = checks.iter().filter(|c| c.is_failed()).count();
    let pending = checks.iter().filter(|c| c.status != "completed").count();

    if failed > 0 {
        ChecksStatus::Failure
    } else if pending > 0 {
        ChecksStatus::Pending
    } else {
        ChecksStatus::Success
    }
}

/// Names of failed checks, in rollup order.
pub fn failed_check_names(checks: &[CheckRun]) -> Vec<String> {
    checks
        .iter()
        .filter(|c| c.is_failed())
        .map(|c| c.name.clone())
        .collect()
}

/// Extracts the pull request number from its URL.
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    url: String,
    #[serde(default)]
    title: String,
    state: PrState,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    head_ref_name: String,
    #[serde(default)]
    base_ref_name: String,
    #[serde(default)]
    mergeable: String,
}

impl From<GhPullRequest> for PullRequest {
    fn from(pr: GhPullRequest) -> Self {
        Self {
            number: pr.number,
            url: pr.url,
            title: pr.title,
            state: pr.state,
            draft: pr.is_draft,
            head_branch: pr.head_ref_name,
            base_branch: pr.base_ref_name,
            mergeable: pr.mergeable == "MERGEABLE",
        }
    }
}

const PR_FIELDS: &str = "number,url,title,state,isDraft,headRefName,baseRefName,mergeable";

#[derive(Deserialize)]
struct GhAuthor {
    #[serde(default)]
    login: String,
}

#[derive(Deserialize)]
struct GhReview {
    author: Option<GhAuthor>,
    state: String,
}

/// Entry of `statusCheckRollup`: either a check run or a commit status.
#[derive(Deserialize)]
struct GhCheck {
    /// Check run name.
    #[serde(default)]
    name: Option<String>,
    /// Commit status name.
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl From<GhCheck> for CheckRun {
    fn from(check: GhCheck) -> Self {
        let name = check.name.or(check.context).unwrap_or_default();
        if let Some(state) = check.state {
            // Commit statuses carry a single state field.
            let state = state.to_ascii_lowercase();
            return match state.as_str() {
                "pending" | "expected" => CheckRun {
                    name,
                    status: "pending".to_string(),
                    conclusion: None,
                },
                _ => CheckRun {
                    name,
                    status: "completed".to_string(),
                    conclusion: Some(state),
                },
            };
        }
        CheckRun {
            name,
            status: check
                .status
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| "completed".to_string()),
            conclusion: check
                .conclusion
                .filter(|c| !c.is_empty())
                .map(|c| c.to_ascii_lowercase()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhStatusView {
    #[serde(default)]
    reviews: Vec<GhReview>,
    #[serde(default)]
    status_check_rollup: Option<Vec<GhCheck>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhMergeView {
    merge_commit: Option<GhCommit>,
}

#[derive(Deserialize)]
struct GhCommit {
    oid: String,
}

/// Provider backed by the `gh` CLI, run in the repository directory.
pub struct GhCliProvider {
    repo_path: PathBuf,
}

impl GhCliProvider {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("gh")
            .current_dir(&self.repo_path)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Hosting(format!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn view_pr(&self, number: u64) -> Result<PullRequest> {
        let number = number.to_string();
        let out = self
            .gh(&["pr", "view", &number, "--json", PR_FIELDS])
            .await?;
        let pr: GhPullRequest = serde_json::from_str(&out)?;
        Ok(pr.into())
    }
}

#[async_trait]
impl HostingProvider for GhCliProvider {
    async fn find_pr_by_branch(&self, branch: &str) -> Result<Option<PullRequest>> {
        let out = self
            .gh(&[
                "pr", "list", "--head", branch, "--state", "all", "--limit", "1", "--json",
                PR_FIELDS,
            ])
            .await?;
        let prs: Vec<GhPullRequest> = serde_json::from_str(&out)?;
        Ok(prs.into_iter().next().map(PullRequest::from))
    }

    async fn get_pr_status_summary(&self, pr: &PullRequest) -> Result<PrStatusSummary> {
        let number = pr.number.to_string();
        let out = self
            .gh(&[
                "pr",
                "view",
                &number,
                "--json",
                "reviews,statusCheckRollup",
            ])
            .await?;
        let view: GhStatusView = serde_json::from_str(&out)?;

        let reviews: Vec<Review> = view
            .reviews
            .into_iter()
            .map(|r| Review {
                author: r.author.map(|a| a.login).unwrap_or_default(),
                state: r.state,
            })
            .collect();
        let (review_status, review_count, approval_count) = summarize_reviews(&reviews);

        let (checks_status, failed_checks) = match view.status_check_rollup {
            Some(checks) => {
                let checks: Vec<CheckRun> = checks.into_iter().map(CheckRun::from).collect();
                (summarize_checks(&checks), failed_check_names(&checks))
            }
            None => (ChecksStatus::Unknown, Vec::new()),
        };

        Ok(PrStatusSummary {
            review_status,
            checks_status,
            mergeable: pr.mergeable,
            review_count,
            approval_count,
            failed_checks,
        })
    }

    async fn create_pr(&self, request: &CreatePrRequest) -> Result<PullRequest> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            request.title.as_str(),
            "--body",
            request.body.as_str(),
            "--head",
            request.head.as_str(),
            "--base",
            request.base.as_str(),
        ];
        if request.draft {
            args.push("--draft");
        }
        let out = self.gh(&args).await?;

        let url = out.trim().to_string();
        let number = pr_number_from_url(&url)
            .ok_or_else(|| Error::Hosting(format!("unexpected gh pr create output: {}", url)))?;
        tracing::info!(pr = number, url = %url, "created pull request");

        Ok(PullRequest {
            number,
            url,
            title: request.title.clone(),
            state: PrState::Open,
            draft: request.draft,
            head_branch: request.head.clone(),
            base_branch: request.base.clone(),
            mergeable: false,
        })
    }

    async fn merge_pr(&self, number: u64, method: MergeMethod) -> Result<Option<String>> {
        let n = number.to_string();
        self.gh(&["pr", "merge", &n, method.as_flag()]).await?;

        let pr = self.view_pr(number).await?;
        if pr.state != PrState::Merged {
            // Branch protection may queue the merge instead of completing it.
            tracing::info!(pr = number, "merge requested but not yet completed");
            return Ok(None);
        }

        let out = self.gh(&["pr", "view", &n, "--json", "mergeCommit"]).await?;
        let view: GhMergeView = serde_json::from_str(&out)?;
        Ok(view.merge_commit.map(|c| c.oid))
    }

    async fn create_pr_comment(&self, number: u64, body: &str) -> Result<()> {
        let n = number.to_string();
        self.gh(&["pr", "comment", &n, "--body", body]).await?;
        Ok(())
    }
}
