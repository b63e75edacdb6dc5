use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Display and semantic metadata attached to every status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    pub code: u16,
    pub label: &'static str,
    pub is_failure: bool,
    pub is_success: bool,
    /// Bootstrap-style badge name used by front ends.
    pub badge: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Deleted,
    PendingCodeReview,
    CodeRejected,
    Queued,
    QueuedError,
    Running,
    RunError,
    PendingOutputReview,
    OutputRejected,
    Released,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        Self::Deleted,
        Self::PendingCodeReview,
        Self::CodeRejected,
        Self::Queued,
        Self::QueuedError,
        Self::Running,
        Self::RunError,
        Self::PendingOutputReview,
        Self::OutputRejected,
        Self::Released,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "DELETED",
            Self::PendingCodeReview => "PENDING_CODE_REVIEW",
            Self::CodeRejected => "CODE_REJECTED",
            Self::Queued => "QUEUED",
            Self::QueuedError => "QUEUED_ERROR",
            Self::Running => "RUNNING",
            Self::RunError => "RUN_ERROR",
            Self::PendingOutputReview => "PENDING_OUTPUT_REVIEW",
            Self::OutputRejected => "OUTPUT_REJECTED",
            Self::Released => "RELEASED",
        }
    }

    pub fn info(&self) -> StatusInfo {
        let (code, label, is_failure, is_success, badge) = match self {
            Self::Deleted => (0, "Deleted", true, false, "dark"),
            Self::PendingCodeReview => (10, "Pending Code Review", false, false, "secondary"),
            Self::CodeRejected => (11, "Code Rejected", true, false, "danger"),
            Self::Queued => (20, "Queued", false, false, "info"),
            Self::QueuedError => (21, "Queue Error", true, false, "danger"),
            Self::Running => (30, "Running", false, false, "info"),
            Self::RunError => (31, "Run Error", true, false, "danger"),
            Self::PendingOutputReview => (40, "Pending Output Review", false, false, "warning"),
            Self::OutputRejected => (41, "Output Rejected", true, false, "danger"),
            Self::Released => (50, "Released", false, true, "success"),
        };
        StatusInfo {
            code,
            label,
            is_failure,
            is_success,
            badge,
        }
    }

    /// Terminal statuses have no outgoing transition.
    pub fn is_terminal(&self) -> bool {
        let info = self.info();
        info.is_failure || info.is_success
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid job status: {}", s))
    }
}
