//! Typed error hierarchy for Enclave.
//!
//! Four top-level enums cover the four subsystems:
//! - `JobError`: state machine and job store failures (controller)
//! - `DispatchError`: handing a job to the broker (controller)
//! - `ExecutionError`: building and running a job container (worker)
//! - `CallbackError`: reporting results back to the controller (worker)

use thiserror::Error;

use crate::jobs::machine::Transition;
use crate::jobs::status::JobStatus;

/// Errors from the job state machine and its store.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Cannot {transition} job {id}: status is {from}, expected {expected}")]
    InvalidTransition {
        id: i64,
        transition: Transition,
        from: JobStatus,
        expected: JobStatus,
    },

    #[error("Job {id} is invalid: {message}")]
    Invalid { id: i64, message: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from handing a job to the worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker rejected job {job_id} with status {status}")]
    Rejected { job_id: i64, status: u16 },
}

/// Worker-local errors from building or running a submitted archive.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Archive is not a readable tar.gz: {0}")]
    InvalidArchive(String),

    #[error("Archive entry escapes the build directory: {path}")]
    UnsafeArchivePath { path: String },

    #[error("No {descriptor} found at the archive root or its single top-level directory")]
    NoBuildDescriptor { descriptor: String },

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Container run failed: {0}")]
    RunFailed(String),

    #[error("Container did not exit within {secs}s")]
    Timeout { secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the worker → controller callback relay.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Callback {endpoint} failed transiently: {message}")]
    Transient { endpoint: String, message: String },

    #[error("Callback {endpoint} answered {status}")]
    Rejected { endpoint: String, status: u16 },

    #[error("Callback {endpoint} gave up after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_invalid_transition_names_both_states() {
        let err = JobError::InvalidTransition {
            id: 7,
            transition: Transition::CompleteJobRun,
            from: JobStatus::PendingCodeReview,
            expected: JobStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("complete_job_run"));
        assert!(msg.contains("PENDING_CODE_REVIEW"));
        assert!(msg.contains("RUNNING"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn job_error_converts_from_dispatch_error() {
        let inner = DispatchError::Unreachable("connection refused".into());
        let err: JobError = inner.into();
        match &err {
            JobError::Dispatch(DispatchError::Unreachable(msg)) => {
                assert_eq!(msg, "connection refused");
            }
            _ => panic!("Expected JobError::Dispatch(Unreachable(...))"),
        }
    }

    #[test]
    fn execution_error_converts_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ExecutionError = io_err.into();
        assert!(matches!(err, ExecutionError::Io(_)));
    }

    #[test]
    fn callback_error_exhausted_carries_attempts() {
        let err = CallbackError::Exhausted {
            endpoint: "/start".into(),
            attempts: 5,
            last: "503".into(),
        };
        assert!(err.to_string().contains('5'));
        assert!(err.to_string().contains("/start"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&JobError::JobNotFound { id: 1 });
        assert_std_error(&DispatchError::Unreachable("x".into()));
        assert_std_error(&ExecutionError::Timeout { secs: 1 });
        assert_std_error(&CallbackError::Transient {
            endpoint: "/fail".into(),
            message: "x".into(),
        });
    }
}
