//! CLI command implementations.
//!
//! | Module       | Commands handled          |
//! |--------------|---------------------------|
//! | `controller` | `Controller`, `InitDb`    |
//! | `worker`     | `Worker`                  |
//! | `config`     | `Config`                  |

pub mod config;
pub mod controller;
pub mod worker;

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use enclave::config::{DEFAULT_CONFIG_PATH, ValidationReport};
use tracing::{info, warn};

pub use config::cmd_config;
pub use controller::{cmd_controller, cmd_init_db};
pub use worker::cmd_worker;

pub fn config_path(cli_path: Option<&Path>) -> PathBuf {
    cli_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Log warnings and refuse to start on errors.
fn ensure_valid(report: &ValidationReport) -> Result<()> {
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    if !report.is_ok() {
        bail!("Invalid configuration:\n  {}", report.errors.join("\n  "));
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
