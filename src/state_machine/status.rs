use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a correction work item.
///
/// Pending → Processing → {Completed, Failed, Skipped, NoChanges}, with
/// Processing → Pending for reclaimed items and Pending → Skipped for
/// collapsed duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
    NoChanges,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 6] = [
        WorkStatus::Pending,
        WorkStatus::Processing,
        WorkStatus::Completed,
        WorkStatus::Failed,
        WorkStatus::Skipped,
        WorkStatus::NoChanges,
    ];

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Pending or Processing. Guarded by the dedup gate.
    pub fn is_active(self) -> bool {
        matches!(self, WorkStatus::Pending | WorkStatus::Processing)
    }

    pub fn can_transition_to(self, next: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Skipped)
                | (Processing, NoChanges)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Skipped => "skipped",
            WorkStatus::NoChanges => "no_changes",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

/// What kind of generated content an item repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionType {
    Specs,
    Pricing,
    Introduction,
    Title,
    Comparisons,
    Versions,
}

impl CorrectionType {
    pub const ALL: [CorrectionType; 6] = [
        CorrectionType::Specs,
        CorrectionType::Pricing,
        CorrectionType::Introduction,
        CorrectionType::Title,
        CorrectionType::Comparisons,
        CorrectionType::Versions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CorrectionType::Specs => "specs",
            CorrectionType::Pricing => "pricing",
            CorrectionType::Introduction => "introduction",
            CorrectionType::Title => "title",
            CorrectionType::Comparisons => "comparisons",
            CorrectionType::Versions => "versions",
        }
    }

    /// Days before a subject corrected for this type is eligible again.
    pub fn default_cooldown_days(self) -> i64 {
        match self {
            CorrectionType::Pricing => 3,
            CorrectionType::Specs | CorrectionType::Versions => 30,
            CorrectionType::Comparisons => 45,
            CorrectionType::Introduction | CorrectionType::Title => 60,
        }
    }

    /// Pricing drifts fastest, so it is drained first.
    pub fn default_priority(self) -> i32 {
        match self {
            CorrectionType::Pricing => 10,
            CorrectionType::Specs | CorrectionType::Versions => 5,
            CorrectionType::Comparisons => 3,
            CorrectionType::Introduction | CorrectionType::Title => 1,
        }
    }
}

impl fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CorrectionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown correction type '{s}'"))
    }
}
