//! Canonical pull request status.

use crate::hosting::{PrState, PrStatusSummary, PullRequest, ReviewStatus};
use crate::task::PrStatus;

/// Maps a pull request and its review summary to one canonical status.
///
/// Hosting state wins over everything (a merged draft is `Merged`), then
/// the draft flag, then the review decision.
pub fn resolve_pr_status(pr: &PullRequest, summary: &PrStatusSummary) -> PrStatus {
    match pr.state {
        PrState::Merged => return PrStatus::Merged,
        PrState::Closed => return PrStatus::Closed,
        PrState::Open => {}
    }
    if pr.draft {
        return PrStatus::Draft;
    }
    match summary.review_status {
        ReviewStatus::Approved => PrStatus::Approved,
        ReviewStatus::ChangesRequested => PrStatus::ChangesRequested,
        ReviewStatus::PendingReview => PrStatus::PendingReview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(state: PrState, draft: bool) -> PullRequest {
        PullRequest {
            number: 1,
            state,
            draft,
            ..Default::default()
        }
    }

    fn summary(review_status: ReviewStatus) -> PrStatusSummary {
        PrStatusSummary {
            review_status,
            ..Default::default()
        }
    }

    #[test]
    fn resolves_each_status() {
        let cases = [
            (pr(PrState::Merged, false), ReviewStatus::PendingReview, PrStatus::Merged),
            (pr(PrState::Closed, false), ReviewStatus::Approved, PrStatus::Closed),
            (pr(PrState::Open, true), ReviewStatus::Approved, PrStatus::Draft),
            (pr(PrState::Open, false), ReviewStatus::Approved, PrStatus::Approved),
            (
                pr(PrState::Open, false),
                ReviewStatus::ChangesRequested,
                PrStatus::ChangesRequested,
            ),
            (
                pr(PrState::Open, false),
                ReviewStatus::PendingReview,
                PrStatus::PendingReview,
            ),
        ];

        for (pr, review, expected) in cases {
            assert_eq!(resolve_pr_status(&pr, &summary(review)), expected);
        }
    }

    #[test]
    fn merged_draft_is_merged() {
        assert_eq!(
            resolve_pr_status(&pr(PrState::Merged, true), &summary(ReviewStatus::PendingReview)),
            PrStatus::Merged
        );
    }
}
