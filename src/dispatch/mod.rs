//! Execution dispatch: handing an approved job to the worker.
//!
//! ## Overview
//!
//! The controller never runs code itself. When a reviewer approves a job the
//! engine calls [`Dispatcher::dispatch`], which base64-encodes the archive into
//! a [`DispatchMessage`] and enqueues it on a [`Broker`] with a fixed grace
//! delay. Dispatch is fire-and-forget: the controller only learns about the
//! run through the worker's callbacks.
//!
//! ```text
//! JobEngine ── dispatch() ──> QueueDispatcher ── enqueue(msg, delay) ──> Broker
//!                                                                          │
//!                        ┌─────────────────────────────────────────────────┤
//!                        v                                                 v
//!                RemoteQueue (HTTP POST /enqueue)               LocalQueue (in-process)
//!                        │                                                 │
//!                        └──────────────> worker front door ───────────────┘
//! ```
//!
//! The shared secret never travels inside a [`DispatchMessage`]; only the
//! HTTP transport adds it to the request envelope.

pub mod broker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::DispatchError;

pub use broker::{Broker, LocalQueue, RemoteQueue};

/// Unit of work on the broker: `{ id, file: base64(tar.gz), owner }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub id: i64,
    pub file: String,
    pub owner: String,
}

impl DispatchMessage {
    pub fn encode(job_id: i64, archive: &[u8], owner: &str) -> Self {
        Self {
            id: job_id,
            file: BASE64.encode(archive),
            owner: owner.to_string(),
        }
    }

    pub fn decode_archive(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.file.as_bytes())
    }
}

/// Receipt for an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchHandle {
    pub job_id: i64,
    pub enqueued_at: DateTime<Utc>,
    pub delay: Duration,
}

/// Hands jobs to the execution side.
/// Real implementation: `QueueDispatcher`. Tests substitute their own.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        job_id: i64,
        archive: &[u8],
        owner: &str,
    ) -> Result<DispatchHandle, DispatchError>;
}

/// Dispatcher that enqueues onto a broker after a fixed grace delay.
pub struct QueueDispatcher {
    broker: Arc<dyn Broker>,
    delay: Duration,
}

impl QueueDispatcher {
    pub fn new(broker: Arc<dyn Broker>, delay: Duration) -> Self {
        Self { broker, delay }
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(
        &self,
        job_id: i64,
        archive: &[u8],
        owner: &str,
    ) -> Result<DispatchHandle, DispatchError> {
        let message = DispatchMessage::encode(job_id, archive, owner);
        self.broker.enqueue(message, self.delay).await?;
        info!(job_id, delay_secs = self.delay.as_secs(), "Job dispatched");
        Ok(DispatchHandle {
            job_id,
            enqueued_at: Utc::now(),
            delay: self.delay,
        })
    }
}
