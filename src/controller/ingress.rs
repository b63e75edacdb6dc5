//! Callback endpoints the worker reports to.
//!
//! Every endpoint handles its body in the same order: parse JSON (400),
//! check the shared key (401, before any lookup), look the job up (404),
//! apply the transition (409 when the job is not in the source status).
//! Success is `200` with an empty body.

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::{error, warn};

use super::SharedState;
use crate::auth::presented_key;
use crate::errors::JobError;
use crate::jobs::RunOutput;
use crate::jobs::machine::Transition;

/// The fields read once the key has been accepted.
#[derive(Debug, Deserialize)]
struct CallbackFields {
    id: i64,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    errors: Option<String>,
}

pub fn ingress_router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_job))
        .route("/complete", post(complete_job))
        .route("/fail", post(fail_job))
        .route("/error", post(error_job))
}

async fn start_job(State(state): State<SharedState>, body: Bytes) -> Response {
    handle(&state, Transition::RunJob, &body).await
}

async fn complete_job(State(state): State<SharedState>, body: Bytes) -> Response {
    handle(&state, Transition::CompleteJobRun, &body).await
}

async fn fail_job(State(state): State<SharedState>, body: Bytes) -> Response {
    handle(&state, Transition::FailJobRun, &body).await
}

async fn error_job(State(state): State<SharedState>, body: Bytes) -> Response {
    handle(&state, Transition::ErrorJobRun, &body).await
}

fn decode_stream(field: &str, value: Option<String>) -> Result<Option<Vec<u8>>, Response> {
    match value {
        None => Ok(None),
        Some(encoded) => BASE64.decode(encoded.as_bytes()).map(Some).map_err(|_| {
            (StatusCode::BAD_REQUEST, format!("Invalid base64 in {}", field)).into_response()
        }),
    }
}

async fn handle(state: &SharedState, transition: Transition, body: &[u8]) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    };
    if !state.key.matches(presented_key(&value)) {
        warn!(%transition, "Rejected callback with a missing or wrong key");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let fields: CallbackFields = match serde_json::from_value(value) {
        Ok(fields) => fields,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid callback body: {}", e))
                .into_response();
        }
    };
    let id = fields.id;
    let run_output = match (
        decode_stream("output", fields.output),
        decode_stream("errors", fields.errors),
    ) {
        (Ok(output), Ok(errors)) => RunOutput { output, errors },
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let engine = &state.engine;
    let result = match transition {
        Transition::RunJob => engine.run_job(id).await,
        Transition::CompleteJobRun => engine.complete_job_run(id, run_output).await,
        Transition::FailJobRun => engine.fail_job_run(id, run_output).await,
        _ => engine.error_job_run(id, run_output.errors).await,
    };

    match result {
        Ok(_) => StatusCode::OK.into_response(),
        Err(JobError::JobNotFound { .. }) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e @ JobError::InvalidTransition { .. }) => {
            warn!(job_id = id, %transition, error = %e, "Out-of-order or duplicate callback");
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e) => {
            error!(job_id = id, %transition, error = %e, "Callback could not be applied");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}
