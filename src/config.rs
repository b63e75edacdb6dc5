//! Configuration for both services, read from `.enclave/enclave.toml`.
//!
//! Values are layered file → `.env` / environment → CLI. Every field has a
//! default, so an empty file (or no file) yields a runnable local setup once
//! a runner key is provided.
//!
//! # Configuration File Format
//!
//! ```toml
//! [auth]
//! runner_key = "change-me"          # ENCLAVE_RUNNER_KEY wins
//!
//! [controller]
//! bind = "127.0.0.1:8000"
//! db_path = ".enclave/jobs.db"
//! worker_url = "http://127.0.0.1:8001"
//! enqueue_path = "/enqueue"
//! dispatch_delay_secs = 10
//! max_body_bytes = 268435456          # applies to API uploads and callbacks
//!
//! [worker]
//! bind = "127.0.0.1:8001"
//! controller_url = "http://127.0.0.1:8000"
//! queue_delay_secs = 10
//! concurrency = 1
//! max_body_bytes = 268435456
//!
//! [sandbox]
//! memory = "4g"
//! cpu_period = 100000
//! cpu_quota = 200000
//! network = "job-network"
//! env_file = "/etc/enclave/job.env"
//! timeout_secs = 3600
//!
//! [sandbox.volumes]
//! "/data" = "/srv/enclave/data"
//!
//! [retry]
//! attempts = 5
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::RunnerKey;
use crate::retry::RetryPolicy;
use crate::worker::{CallbackPaths, SandboxConfig};

pub const DEFAULT_CONFIG_PATH: &str = ".enclave/enclave.toml";
pub const RUNNER_KEY_ENV: &str = "ENCLAVE_RUNNER_KEY";
/// Request body cap for both services: 256 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Shared secret between controller and worker. Never logged.
    #[serde(default)]
    pub runner_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_controller_bind")]
    pub bind: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_worker_url")]
    pub worker_url: String,
    #[serde(default = "default_enqueue_path")]
    pub enqueue_path: String,
    #[serde(default = "default_delay_secs")]
    pub dispatch_delay_secs: u64,
    /// Largest request body accepted: job uploads and worker callbacks
    /// carrying container output.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_bind")]
    pub bind: String,
    #[serde(default = "default_controller_url")]
    pub controller_url: String,
    #[serde(default = "default_start_path")]
    pub start_path: String,
    #[serde(default = "default_complete_path")]
    pub complete_path: String,
    #[serde(default = "default_fail_path")]
    pub fail_path: String,
    #[serde(default = "default_error_path")]
    pub error_path: String,
    /// Countdown between accepting a job and running it.
    #[serde(default = "default_delay_secs")]
    pub queue_delay_secs: u64,
    /// Jobs executed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_controller_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".enclave/jobs.db")
}

fn default_worker_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_enqueue_path() -> String {
    "/enqueue".to_string()
}

fn default_delay_secs() -> u64 {
    10
}

fn default_worker_bind() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_controller_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_start_path() -> String {
    "/start".to_string()
}

fn default_complete_path() -> String {
    "/complete".to_string()
}

fn default_fail_path() -> String {
    "/fail".to_string()
}

fn default_error_path() -> String {
    "/error".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            bind: default_controller_bind(),
            db_path: default_db_path(),
            worker_url: default_worker_url(),
            enqueue_path: default_enqueue_path(),
            dispatch_delay_secs: default_delay_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            bind: default_worker_bind(),
            controller_url: default_controller_url(),
            start_path: default_start_path(),
            complete_path: default_complete_path(),
            fail_path: default_fail_path(),
            error_path: default_error_path(),
            queue_delay_secs: default_delay_secs(),
            concurrency: default_concurrency(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Everything `enclave.toml` can hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnclaveConfig {
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Outcome of [`EnclaveConfig::validate`]. Errors stop the services.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl EnclaveConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse enclave.toml")
    }

    /// Defaults when `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize enclave.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// File, then `.env`, then process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load_or_default(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(RUNNER_KEY_ENV).filter(|k| !k.is_empty()) {
            self.auth.runner_key = key;
        }
    }

    pub fn runner_key(&self) -> RunnerKey {
        RunnerKey::new(self.auth.runner_key.clone())
    }

    pub fn controller_addr(&self) -> Result<SocketAddr> {
        self.controller
            .bind
            .parse()
            .with_context(|| format!("Invalid controller.bind '{}'", self.controller.bind))
    }

    pub fn worker_addr(&self) -> Result<SocketAddr> {
        self.worker
            .bind
            .parse()
            .with_context(|| format!("Invalid worker.bind '{}'", self.worker.bind))
    }

    /// Full URL of the worker's enqueue endpoint.
    pub fn enqueue_url(&self) -> String {
        format!(
            "{}{}",
            self.controller.worker_url.trim_end_matches('/'),
            self.controller.enqueue_path
        )
    }

    pub fn callback_paths(&self) -> CallbackPaths {
        CallbackPaths {
            start: self.worker.start_path.clone(),
            complete: self.worker.complete_path.clone(),
            fail: self.worker.fail_path.clone(),
            error: self.worker.error_path.clone(),
        }
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth.runner_key.is_empty() {
            copy.auth.runner_key = "***".to_string();
        }
        copy
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.auth.runner_key.is_empty() {
            report.errors.push(format!(
                "auth.runner_key is empty; set it in the config file or {}",
                RUNNER_KEY_ENV
            ));
        }
        if let Err(e) = self.controller_addr() {
            report.errors.push(e.to_string());
        }
        if let Err(e) = self.worker_addr() {
            report.errors.push(e.to_string());
        }
        for (name, url) in [
            ("controller.worker_url", &self.controller.worker_url),
            ("worker.controller_url", &self.worker.controller_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                report
                    .errors
                    .push(format!("{} must be an http(s) URL, got '{}'", name, url));
            }
        }
        let paths = self.callback_paths();
        for path in [
            &self.controller.enqueue_path,
            &paths.start,
            &paths.complete,
            &paths.fail,
            &paths.error,
        ] {
            if !path.starts_with('/') {
                report
                    .errors
                    .push(format!("Endpoint path '{}' must start with '/'", path));
            }
        }
        if self.worker.concurrency == 0 {
            report.errors.push("worker.concurrency must be at least 1".to_string());
        }
        if self.controller.max_body_bytes == 0 || self.worker.max_body_bytes == 0 {
            report.errors.push("max_body_bytes must be at least 1".to_string());
        }
        if self.retry.attempts == 0 {
            report.errors.push("retry.attempts must be at least 1".to_string());
        }
        if let Err(e) = self.sandbox.limits() {
            report.errors.push(format!("sandbox: {:#}", e));
        }
        if let Err(e) = self.sandbox.job_env() {
            report.errors.push(format!("sandbox: {:#}", e));
        }

        report.warnings.extend(self.sandbox.warnings());
        if !self.auth.runner_key.is_empty() && self.auth.runner_key.len() < 16 {
            report
                .warnings
                .push("auth.runner_key is shorter than 16 characters".to_string());
        }
        report
    }
}
