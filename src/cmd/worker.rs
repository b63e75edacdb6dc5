//! Worker service command: `enclave worker`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use enclave::config::EnclaveConfig;
use enclave::dispatch::LocalQueue;
use enclave::worker::server::start_server;
use enclave::worker::{CallbackRelay, DockerRuntime, JobRunner, Sandbox, WorkerState, consume};
use tracing::info;

use super::{ensure_valid, shutdown_signal};

pub async fn cmd_worker(config: EnclaveConfig) -> Result<()> {
    ensure_valid(&config.validate())?;
    let addr = config.worker_addr()?;
    let key = config.runner_key();

    let runtime = Arc::new(DockerRuntime::connect()?);
    let sandbox = Arc::new(Sandbox::new(runtime, config.sandbox.clone())?);
    let relay = Arc::new(CallbackRelay::new(
        config.worker.controller_url.clone(),
        config.callback_paths(),
        key.expose(),
        config.retry.clone(),
    ));
    let runner = Arc::new(JobRunner::new(sandbox, relay));

    let (queue, rx) = LocalQueue::new();
    let consumer = tokio::spawn(consume(rx, runner, config.worker.concurrency));
    info!(
        controller = %config.worker.controller_url,
        concurrency = config.worker.concurrency,
        "Starting worker"
    );

    let state = WorkerState {
        queue: Arc::new(queue),
        key,
        delay: Duration::from_secs(config.worker.queue_delay_secs),
        max_body_bytes: config.worker.max_body_bytes,
    };
    start_server(addr, state, shutdown_signal()).await?;

    // The queue closed with the server; let accepted jobs finish.
    info!("Waiting for accepted jobs to finish");
    consumer.await.context("Job consumer panicked")?;
    Ok(())
}
