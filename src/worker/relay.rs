use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::CallbackError;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Controller endpoints the worker reports to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPaths {
    pub start: String,
    pub complete: String,
    pub fail: String,
    pub error: String,
}

impl Default for CallbackPaths {
    fn default() -> Self {
        Self {
            start: "/start".to_string(),
            complete: "/complete".to_string(),
            fail: "/fail".to_string(),
            error: "/error".to_string(),
        }
    }
}

/// JSON body of every callback. Streams are base64 and omitted when empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackBody {
    pub key: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
}

fn encode_stream(bytes: &[u8]) -> Option<String> {
    (!bytes.is_empty()).then(|| BASE64.encode(bytes))
}

/// Worker-side client for the controller's callback endpoints.
///
/// Every call is retried with capped exponential backoff on network failures
/// and non-2xx answers; the first 2xx stops retrying.
pub struct CallbackRelay {
    client: reqwest::Client,
    base_url: String,
    paths: CallbackPaths,
    key: String,
    policy: RetryPolicy,
}

impl CallbackRelay {
    pub fn new(
        base_url: impl Into<String>,
        paths: CallbackPaths,
        key: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            paths,
            key: key.into(),
            policy,
        }
    }

    pub async fn start(&self, id: i64) -> Result<(), CallbackError> {
        self.send(&self.paths.start, id, None, None).await
    }

    pub async fn complete(
        &self,
        id: i64,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<(), CallbackError> {
        self.send(
            &self.paths.complete,
            id,
            encode_stream(stdout),
            encode_stream(stderr),
        )
        .await
    }

    pub async fn fail(&self, id: i64, stdout: &[u8], stderr: &[u8]) -> Result<(), CallbackError> {
        self.send(
            &self.paths.fail,
            id,
            encode_stream(stdout),
            encode_stream(stderr),
        )
        .await
    }

    /// Report a build or run error; `message` becomes the job's error stream.
    pub async fn error(&self, id: i64, message: &str) -> Result<(), CallbackError> {
        self.send(&self.paths.error, id, None, encode_stream(message.as_bytes()))
            .await
    }

    async fn send(
        &self,
        path: &str,
        id: i64,
        output: Option<String>,
        errors: Option<String>,
    ) -> Result<(), CallbackError> {
        let url = format!("{}{}", self.base_url, path);
        let body = CallbackBody {
            key: self.key.clone(),
            id,
            output,
            errors,
        };
        debug!(job_id = id, endpoint = path, "Sending callback");
        retry_with_backoff(&self.policy, path, |_| self.post_once(&url, path, &body))
            .await
            .map_err(|exhausted| CallbackError::Exhausted {
                endpoint: path.to_string(),
                attempts: exhausted.attempts,
                last: exhausted.last.to_string(),
            })?;
        info!(job_id = id, endpoint = path, "Callback delivered");
        Ok(())
    }

    async fn post_once(
        &self,
        url: &str,
        path: &str,
        body: &CallbackBody,
    ) -> Result<(), CallbackError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CallbackError::Transient {
                endpoint: path.to_string(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(CallbackError::Rejected {
                endpoint: path.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Server that fails the first `failures` requests with 503, then records
    /// bodies and answers 200.
    type Received = Arc<Mutex<Vec<CallbackBody>>>;

    async fn flaky_server(failures: u32) -> (String, Arc<AtomicU32>, Received) {
        let calls = Arc::new(AtomicU32::new(0));
        let bodies: Arc<Mutex<Vec<CallbackBody>>> = Arc::default();
        let (c, b) = (calls.clone(), bodies.clone());
        let handler = move |Json(body): Json<CallbackBody>| {
            let (calls, bodies) = (c.clone(), b.clone());
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    return StatusCode::SERVICE_UNAVAILABLE;
                }
                bodies.lock().unwrap().push(body);
                StatusCode::OK
            }
        };
        let app = Router::new()
            .route("/start", post(handler.clone()))
            .route("/complete", post(handler.clone()))
            .route("/fail", post(handler.clone()))
            .route("/error", post(handler));
        (serve(app).await, calls, bodies)
    }

    #[tokio::test]
    async fn test_start_sends_key_and_id_only() {
        let (url, _, bodies) = flaky_server(0).await;
        let relay = CallbackRelay::new(url, CallbackPaths::default(), "s3cret", fast_policy(1));
        relay.start(12).await.unwrap();

        let bodies = bodies.lock().unwrap();
        assert_eq!(
            bodies[0],
            CallbackBody {
                key: "s3cret".into(),
                id: 12,
                output: None,
                errors: None
            }
        );
    }

    #[tokio::test]
    async fn test_complete_encodes_streams_and_skips_empty() {
        let (url, _, bodies) = flaky_server(0).await;
        let relay = CallbackRelay::new(url, CallbackPaths::default(), "k", fast_policy(1));
        relay.complete(3, b"Hello from Docker!\n", b"").await.unwrap();

        let body = bodies.lock().unwrap()[0].clone();
        let output = BASE64.decode(body.output.unwrap()).unwrap();
        assert_eq!(output, b"Hello from Docker!\n");
        assert!(body.errors.is_none());
    }

    #[tokio::test]
    async fn test_error_carries_message_as_errors_stream() {
        let (url, _, bodies) = flaky_server(0).await;
        let relay = CallbackRelay::new(url, CallbackPaths::default(), "k", fast_policy(1));
        relay.error(3, "No Dockerfile found").await.unwrap();

        let body = bodies.lock().unwrap()[0].clone();
        assert_eq!(BASE64.decode(body.errors.unwrap()).unwrap(), b"No Dockerfile found");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (url, calls, bodies) = flaky_server(2).await;
        let relay = CallbackRelay::new(url, CallbackPaths::default(), "k", fast_policy(5));
        relay.fail(8, b"", b"Goodbye").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let (url, calls, _) = flaky_server(u32::MAX).await;
        let relay = CallbackRelay::new(url, CallbackPaths::default(), "k", fast_policy(5));
        let err = relay.start(1).await.unwrap_err();

        match err {
            CallbackError::Exhausted {
                endpoint,
                attempts,
                last,
            } => {
                assert_eq!(endpoint, "/start");
                assert_eq!(attempts, 5);
                assert!(last.contains("503"));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_network_failure_is_transient() {
        let relay = CallbackRelay::new(
            "http://127.0.0.1:9",
            CallbackPaths::default(),
            "k",
            fast_policy(2),
        );
        let err = relay.start(1).await.unwrap_err();
        assert!(matches!(err, CallbackError::Exhausted { attempts: 2, .. }));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let relay = CallbackRelay::new(
            "http://portal:8000/",
            CallbackPaths::default(),
            "k",
            RetryPolicy::once(),
        );
        assert_eq!(relay.base_url, "http://portal:8000");
    }
}
