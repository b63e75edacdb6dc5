//! Explicit transition table for the job lifecycle.
//!
//! ```text
//!                    reject_code ──> CODE_REJECTED
//!                   ┌─ delete_job ──> DELETED
//! PENDING_CODE_REVIEW ─ approve_code ─> QUEUED ─ queue_failed ─> QUEUED_ERROR
//!                                         │
//!                                      run_job
//!                                         v
//!                                      RUNNING ─ error_job_run ─> RUN_ERROR
//!                                         │
//!                      complete_job_run / fail_job_run
//!                                         v
//!                              PENDING_OUTPUT_REVIEW ─ reject_output ─> OUTPUT_REJECTED
//!                                         │
//!                                   approve_output
//!                                         v
//!                                      RELEASED
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::status::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    ApproveCode,
    QueueFailed,
    RejectCode,
    DeleteJob,
    RunJob,
    ErrorJobRun,
    CompleteJobRun,
    FailJobRun,
    ApproveOutput,
    RejectOutput,
}

/// Who is allowed to drive a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A human reviewer or the job owner.
    Reviewer,
    /// The worker, through an authenticated callback.
    Callback,
    /// The engine itself, as a consequence of another transition.
    System,
}

/// Work the engine performs as part of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    None,
    /// Hand the job to the dispatcher; roll into `queue_failed` if that fails.
    Dispatch,
    /// Persist captured output/error streams; `failed` marks an abnormal run.
    StoreRunOutput { failed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSpec {
    pub transition: Transition,
    pub source: JobStatus,
    pub target: JobStatus,
    pub origin: Origin,
    pub side_effect: SideEffect,
    /// Whether the acting user is recorded in the transition log.
    pub records_actor: bool,
}

impl Transition {
    pub const ALL: [Transition; 10] = [
        Self::ApproveCode,
        Self::QueueFailed,
        Self::RejectCode,
        Self::DeleteJob,
        Self::RunJob,
        Self::ErrorJobRun,
        Self::CompleteJobRun,
        Self::FailJobRun,
        Self::ApproveOutput,
        Self::RejectOutput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveCode => "approve_code",
            Self::QueueFailed => "queue_failed",
            Self::RejectCode => "reject_code",
            Self::DeleteJob => "delete_job",
            Self::RunJob => "run_job",
            Self::ErrorJobRun => "error_job_run",
            Self::CompleteJobRun => "complete_job_run",
            Self::FailJobRun => "fail_job_run",
            Self::ApproveOutput => "approve_output",
            Self::RejectOutput => "reject_output",
        }
    }

    pub fn spec(&self) -> TransitionSpec {
        use JobStatus::*;
        let (source, target, origin, side_effect, records_actor) = match self {
            Self::ApproveCode => (
                PendingCodeReview,
                Queued,
                Origin::Reviewer,
                SideEffect::Dispatch,
                true,
            ),
            Self::QueueFailed => (Queued, QueuedError, Origin::System, SideEffect::None, false),
            Self::RejectCode => (
                PendingCodeReview,
                CodeRejected,
                Origin::Reviewer,
                SideEffect::None,
                true,
            ),
            Self::DeleteJob => (
                PendingCodeReview,
                Deleted,
                Origin::Reviewer,
                SideEffect::None,
                true,
            ),
            Self::RunJob => (Queued, Running, Origin::Callback, SideEffect::None, false),
            Self::ErrorJobRun => (
                Running,
                RunError,
                Origin::Callback,
                SideEffect::StoreRunOutput { failed: true },
                false,
            ),
            Self::CompleteJobRun => (
                Running,
                PendingOutputReview,
                Origin::Callback,
                SideEffect::StoreRunOutput { failed: false },
                false,
            ),
            Self::FailJobRun => (
                Running,
                PendingOutputReview,
                Origin::Callback,
                SideEffect::StoreRunOutput { failed: true },
                false,
            ),
            Self::ApproveOutput => (
                PendingOutputReview,
                Released,
                Origin::Reviewer,
                SideEffect::None,
                true,
            ),
            Self::RejectOutput => (
                PendingOutputReview,
                OutputRejected,
                Origin::Reviewer,
                SideEffect::None,
                true,
            ),
        };
        TransitionSpec {
            transition: *self,
            source,
            target,
            origin,
            side_effect,
            records_actor,
        }
    }

    /// Message shown in a job's history for this transition.
    pub fn history_message(&self) -> &'static str {
        match self {
            Self::ApproveCode => "The job's code has been approved and added to the queue.",
            Self::QueueFailed => "The job could not be queued for execution.",
            Self::RejectCode => "The job's code was rejected.",
            Self::DeleteJob => "The job was deleted.",
            Self::RunJob => "The job has started running.",
            Self::ErrorJobRun => "The job could not be built or run.",
            Self::CompleteJobRun => "The job has successfully finished running.",
            Self::FailJobRun => "The job failed due to an error.",
            Self::ApproveOutput => "The job's output was approved and released.",
            Self::RejectOutput => "The job's output was rejected.",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid transition: {}", s))
    }
}

/// Transitions whose source is `status`.
pub fn available_from(status: JobStatus) -> Vec<Transition> {
    Transition::ALL
        .into_iter()
        .filter(|t| t.spec().source == status)
        .collect()
}

/// Every status reachable from `start` (inclusive) by following the table.
pub fn reachable_from(start: JobStatus) -> BTreeSet<&'static str> {
    let mut seen = BTreeSet::from([start.as_str()]);
    let mut queue = VecDeque::from([start]);
    while let Some(status) = queue.pop_front() {
        for transition in available_from(status) {
            let target = transition.spec().target;
            if seen.insert(target.as_str()) {
                queue.push_back(target);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_status_is_reachable_from_pending_code_review() {
        let reachable = reachable_from(JobStatus::PendingCodeReview);
        let all: BTreeSet<&str> = JobStatus::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(reachable, all);
    }

    #[test]
    fn test_terminal_statuses_have_no_outgoing_transitions() {
        for status in JobStatus::ALL {
            if status.is_terminal() {
                assert!(available_from(status).is_empty(), "{} has exits", status);
            } else {
                assert!(!available_from(status).is_empty(), "{} is a dead end", status);
            }
        }
    }

    #[test]
    fn test_transition_table_matches_lifecycle() {
        let approve = Transition::ApproveCode.spec();
        assert_eq!(approve.source, JobStatus::PendingCodeReview);
        assert_eq!(approve.target, JobStatus::Queued);
        assert_eq!(approve.side_effect, SideEffect::Dispatch);

        let fail = Transition::FailJobRun.spec();
        assert_eq!(fail.source, JobStatus::Running);
        assert_eq!(fail.target, JobStatus::PendingOutputReview);
        assert_eq!(fail.side_effect, SideEffect::StoreRunOutput { failed: true });

        let complete = Transition::CompleteJobRun.spec();
        assert_eq!(complete.side_effect, SideEffect::StoreRunOutput { failed: false });

        assert_eq!(Transition::QueueFailed.spec().origin, Origin::System);
        assert_eq!(Transition::RunJob.spec().origin, Origin::Callback);
    }

    #[test]
    fn test_pending_code_review_exits() {
        let exits = available_from(JobStatus::PendingCodeReview);
        assert_eq!(
            exits,
            vec![Transition::ApproveCode, Transition::RejectCode, Transition::DeleteJob]
        );
    }

    #[test]
    fn test_transition_parses_from_snake_case() {
        assert_eq!("fail_job_run".parse::<Transition>().unwrap(), Transition::FailJobRun);
        assert!("approve".parse::<Transition>().is_err());
        for t in Transition::ALL {
            assert_eq!(t.to_string().parse::<Transition>().unwrap(), t);
        }
    }
}
