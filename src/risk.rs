//! Risk classification of a synced branch.
//!
//! The level grows with the size of the diff against the target branch and
//! with the number of conflicts that had to be resolved during the sync.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How risky a finalized change is. `Unknown` when not assessed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Unknown => "unknown",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for RiskLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(RiskLevel::Unknown),
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(Error::Validation(format!("unknown risk level: {}", other))),
        }
    }
}

/// Size of a branch diff against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStat {
    pub files_changed: u32,
    /// Added plus removed lines. Binary files count as zero lines.
    pub lines_changed: u32,
}

impl DiffStat {
    /// Parses `git diff --numstat` output.
    pub fn parse_numstat(output: &str) -> Self {
        let mut stat = DiffStat::default();
        for line in output.lines() {
            let mut fields = line.split('\t');
            let (Some(added), Some(removed), Some(_path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            stat.files_changed += 1;
            // Binary files report "-" for both counts.
            stat.lines_changed += added.parse::<u32>().unwrap_or(0);
            stat.lines_changed += removed.parse::<u32>().unwrap_or(0);
        }
        stat
    }
}

/// Outcome of assessing a synced branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub files_changed: u32,
    pub lines_changed: u32,
    /// The level reached the re-review threshold.
    pub needs_review: bool,
}

impl RiskAssessment {
    pub fn assess(stat: DiffStat, conflicts: u32, threshold: RiskLevel) -> Self {
        let level = classify_risk(stat.files_changed, stat.lines_changed, conflicts);
        Self {
            level,
            files_changed: stat.files_changed,
            lines_changed: stat.lines_changed,
            needs_review: should_trigger_review(level, threshold),
        }
    }
}

/// Classifies by the first band any of the three measures falls into.
pub fn classify_risk(files: u32, lines: u32, conflicts: u32) -> RiskLevel {
    if files > 30 || lines > 1000 || conflicts > 10 {
        RiskLevel::Critical
    } else if files > 15 || lines > 500 || conflicts > 3 {
        RiskLevel::High
    } else if files > 5 || lines > 100 || conflicts > 0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// True when `level` is at or above `threshold`. An unknown level never
/// triggers a review.
pub fn should_trigger_review(level: RiskLevel, threshold: RiskLevel) -> bool {
    level != RiskLevel::Unknown && level >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_highest_band() {
        assert_eq!(classify_risk(0, 0, 0), RiskLevel::Low);
        assert_eq!(classify_risk(5, 100, 0), RiskLevel::Low);
        assert_eq!(classify_risk(6, 0, 0), RiskLevel::Medium);
        assert_eq!(classify_risk(1, 101, 0), RiskLevel::Medium);
        assert_eq!(classify_risk(1, 1, 1), RiskLevel::Medium);
        assert_eq!(classify_risk(16, 0, 0), RiskLevel::High);
        assert_eq!(classify_risk(1, 501, 0), RiskLevel::High);
        assert_eq!(classify_risk(1, 1, 4), RiskLevel::High);
        assert_eq!(classify_risk(31, 0, 0), RiskLevel::Critical);
        assert_eq!(classify_risk(1, 1001, 0), RiskLevel::Critical);
        assert_eq!(classify_risk(1, 1, 11), RiskLevel::Critical);
    }

    #[test]
    fn review_threshold_is_inclusive() {
        assert!(should_trigger_review(RiskLevel::High, RiskLevel::High));
        assert!(should_trigger_review(RiskLevel::Critical, RiskLevel::High));
        assert!(!should_trigger_review(RiskLevel::Medium, RiskLevel::High));
        assert!(should_trigger_review(RiskLevel::Low, RiskLevel::Low));
        assert!(!should_trigger_review(RiskLevel::Unknown, RiskLevel::Unknown));
    }

    #[test]
    fn parses_numstat_with_binary_files() {
        let output = "10\t2\tsrc/lib.rs\n-\t-\tassets/logo.png\n0\t7\tREADME.md\n";
        let stat = DiffStat::parse_numstat(output);
        assert_eq!(stat.files_changed, 3);
        assert_eq!(stat.lines_changed, 19);
        assert_eq!(DiffStat::parse_numstat(""), DiffStat::default());
    }

    #[test]
    fn assessment_flags_review() {
        let stat = DiffStat {
            files_changed: 20,
            lines_changed: 40,
        };
        let risk = RiskAssessment::assess(stat, 0, RiskLevel::High);
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.needs_review);
        assert_eq!(risk.files_changed, 20);

        let risk = RiskAssessment::assess(stat, 0, RiskLevel::Critical);
        assert!(!risk.needs_review);
    }

    #[test]
    fn level_round_trips_through_strings() {
        for level in [RiskLevel::Low, RiskLevel::Critical] {
            assert_eq!(level.to_string().parse::<RiskLevel>().unwrap(), level);
        }
        assert!("severe".parse::<RiskLevel>().is_err());
        assert_eq!(
            serde_json::to_string(&RiskLevel::Medium).unwrap(),
            "\"medium\""
        );
    }
}
