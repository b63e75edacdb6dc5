//! Controller service: owns job state, serves the reviewer API, dispatches
//! approved jobs and applies the worker's callbacks.

pub mod api;
pub mod ingress;
pub mod server;

use std::sync::Arc;

use crate::auth::RunnerKey;
use crate::jobs::JobEngine;

pub struct AppState {
    pub engine: JobEngine,
    pub key: RunnerKey,
    /// Largest request body the API and callback routes accept.
    pub max_body_bytes: usize,
}

pub type SharedState = Arc<AppState>;

pub use api::ApiError;
pub use server::{build_router, start_server};
