use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::DispatchMessage;
use crate::errors::DispatchError;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Message-passing channel between controller and worker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue `message`; the consumer must not start it before `delay` elapses.
    async fn enqueue(&self, message: DispatchMessage, delay: Duration)
    -> Result<(), DispatchError>;
}

/// A message waiting on the in-process queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub message: DispatchMessage,
    pub delay: Duration,
}

/// In-process queue feeding the worker's consumer loop.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

impl LocalQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Broker for LocalQueue {
    async fn enqueue(
        &self,
        message: DispatchMessage,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        self.tx
            .send(QueuedJob { message, delay })
            .map_err(|_| DispatchError::Unreachable("worker queue is closed".into()))
    }
}

/// Body of `POST /enqueue` on the worker's front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub key: String,
    pub id: i64,
    pub file: String,
    pub owner: String,
}

impl EnqueueRequest {
    pub fn into_message(self) -> DispatchMessage {
        DispatchMessage {
            id: self.id,
            file: self.file,
            owner: self.owner,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnqueueResponse {
    pub result: String,
}

/// HTTP transport to a worker's `POST /enqueue`.
///
/// The worker applies its own countdown before running the job, so the
/// `delay` passed to [`Broker::enqueue`] is not transmitted.
pub struct RemoteQueue {
    client: reqwest::Client,
    url: String,
    key: String,
    policy: RetryPolicy,
}

impl RemoteQueue {
    pub fn new(url: impl Into<String>, key: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            key: key.into(),
            policy,
        }
    }

    async fn post_once(&self, body: &EnqueueRequest) -> Result<(), DispatchError> {
        let resp = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| DispatchError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DispatchError::Rejected {
                job_id: body.id,
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RemoteQueue {
    async fn enqueue(
        &self,
        message: DispatchMessage,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        debug!(
            job_id = message.id,
            delay_secs = delay.as_secs(),
            url = %self.url,
            "Posting job to worker"
        );
        let body = EnqueueRequest {
            key: self.key.clone(),
            id: message.id,
            file: message.file,
            owner: message.owner,
        };
        retry_with_backoff(&self.policy, "enqueue", |_| self.post_once(&body))
            .await
            .map_err(|exhausted| exhausted.last)
    }
}
