//! Controller service command: `enclave controller`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use enclave::config::EnclaveConfig;
use enclave::controller::{AppState, start_server};
use enclave::dispatch::{QueueDispatcher, RemoteQueue};
use enclave::jobs::{DbHandle, JobDb, JobEngine};
use tracing::info;

use super::{ensure_valid, shutdown_signal};

fn open_db(path: &Path) -> Result<JobDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    JobDb::new(path).with_context(|| format!("Failed to open job database {}", path.display()))
}

pub fn cmd_init_db(path: &Path) -> Result<()> {
    open_db(path)?;
    println!("Job database initialized at {}", path.display());
    Ok(())
}

pub async fn cmd_controller(config: EnclaveConfig) -> Result<()> {
    ensure_valid(&config.validate())?;
    let addr = config.controller_addr()?;
    let key = config.runner_key();

    let db = DbHandle::new(open_db(&config.controller.db_path)?);
    let broker = Arc::new(RemoteQueue::new(
        config.enqueue_url(),
        key.expose(),
        config.retry.clone(),
    ));
    let dispatcher = Arc::new(QueueDispatcher::new(
        broker,
        Duration::from_secs(config.controller.dispatch_delay_secs),
    ));
    info!(
        db = %config.controller.db_path.display(),
        worker = %config.enqueue_url(),
        "Starting controller"
    );

    let state = Arc::new(AppState {
        engine: JobEngine::new(db, dispatcher),
        key,
        max_body_bytes: config.controller.max_body_bytes,
    });
    start_server(addr, state, shutdown_signal()).await
}
