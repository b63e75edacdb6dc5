//! Job lifecycle: statuses, the transition table, the record store, and the
//! engine that applies transitions.
//!
//! Status is only ever changed through [`JobEngine::apply_transition`] (or one
//! of its named wrappers). Every successful transition writes exactly one
//! [`TransitionLogEntry`] in the same database transaction as the status
//! update.

pub mod db;
pub mod engine;
pub mod machine;
pub mod models;
pub mod status;

pub use db::{DbHandle, JobDb, TransitionChange};
pub use engine::JobEngine;
pub use machine::{Transition, TransitionSpec};
pub use models::{
    BlobField, Comment, HistoryEvent, Job, JobDetail, NewJob, RunOutput, TransitionLogEntry,
};
pub use status::{JobStatus, StatusInfo};
