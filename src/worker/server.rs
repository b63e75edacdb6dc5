use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::DefaultBodyLimit,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{RunnerKey, presented_key};
use crate::dispatch::broker::{Broker, EnqueueRequest, EnqueueResponse};

/// Shared state for the worker's front door.
#[derive(Clone)]
pub struct WorkerState {
    pub queue: Arc<dyn Broker>,
    pub key: RunnerKey,
    /// Countdown before an accepted job may start.
    pub delay: Duration,
    /// Largest enqueue body accepted; archives travel base64-encoded inside it.
    pub max_body_bytes: usize,
}

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn enqueue(State(state): State<WorkerState>, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    };
    if !state.key.matches(presented_key(&value)) {
        warn!("Rejected enqueue with a missing or wrong key");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let request: EnqueueRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid enqueue request: {}", e))
                .into_response();
        }
    };

    let message = request.into_message();
    let job_id = message.id;
    match state.queue.enqueue(message, state.delay).await {
        Ok(()) => {
            info!(job_id, delay_secs = state.delay.as_secs(), "Job queued");
            Json(EnqueueResponse {
                result: "queued".to_string(),
            })
            .into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Serve the front door until `shutdown` resolves.
pub async fn start_server(
    addr: SocketAddr,
    state: WorkerState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind worker to {}", addr))?;
    info!(addr = %listener.local_addr()?, "Worker listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Worker server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchMessage;
    use crate::dispatch::broker::LocalQueue;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    type QueuedRx = tokio::sync::mpsc::UnboundedReceiver<crate::dispatch::broker::QueuedJob>;

    fn test_app_with_limit(max_body_bytes: usize) -> (Router, QueuedRx) {
        let (queue, rx) = LocalQueue::new();
        let state = WorkerState {
            queue: Arc::new(queue),
            key: RunnerKey::new("s3cret"),
            delay: Duration::from_secs(10),
            max_body_bytes,
        };
        (build_router(state), rx)
    }

    fn test_app() -> (Router, QueuedRx) {
        test_app_with_limit(crate::config::DEFAULT_MAX_BODY_BYTES)
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/enqueue")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_accepts_and_queues_with_countdown() {
        let (app, mut rx) = test_app();
        let body = serde_json::json!({"key": "s3cret", "id": 5, "file": "YWJj", "owner": "toejam"});

        let response = app.oneshot(post_json(&body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: EnqueueResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.result, "queued");

        let queued = rx.try_recv().unwrap();
        assert_eq!(
            queued.message,
            DispatchMessage {
                id: 5,
                file: "YWJj".into(),
                owner: "toejam".into()
            }
        );
        assert_eq!(queued.delay, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_enqueue_accepts_archive_larger_than_axum_default() {
        let (app, mut rx) = test_app();
        let file = "A".repeat(3 * 1024 * 1024);
        let body = serde_json::json!({"key": "s3cret", "id": 9, "file": file, "owner": "o"});

        let response = app.oneshot(post_json(&body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.try_recv().unwrap().message.file.len(), 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_enqueue_over_configured_limit_is_rejected() {
        let (app, mut rx) = test_app_with_limit(1024);
        let file = "A".repeat(4096);
        let body = serde_json::json!({"key": "s3cret", "id": 9, "file": file, "owner": "o"});

        let response = app.oneshot(post_json(&body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_wrong_key_is_unauthorized() {
        let (app, mut rx) = test_app();
        let body = serde_json::json!({"key": "guess", "id": 5, "file": "", "owner": "o"});
        let response = app.oneshot(post_json(&body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_missing_key_is_unauthorized() {
        let (app, _rx) = test_app();
        let response = app
            .oneshot(post_json(r#"{"id": 5, "file": "", "owner": "o"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_enqueue_malformed_json_is_bad_request() {
        let (app, _rx) = test_app();
        let response = app.oneshot(post_json("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enqueue_missing_fields_after_auth_is_bad_request() {
        let (app, _rx) = test_app();
        let response = app
            .oneshot(post_json(r#"{"key": "s3cret", "id": 5}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_get() {
        let (app, _rx) = test_app();
        let request = Request::builder()
            .uri("/enqueue")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _rx) = test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
