use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::archive::{digest, extract_archive, find_build_context, pack_context};
use super::runtime::{ContainerLimits, ContainerRuntime, RunSpec};
use crate::errors::ExecutionError;

/// Resource bounds and environment for job containers (`[sandbox]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Memory limit such as `"512m"` or `"4g"`.
    pub memory: Option<String>,
    /// Memory plus swap; unset means no swap beyond `memory`, `"-1"` unlimited.
    pub memory_swap: Option<String>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    /// Docker network the job container joins.
    pub network: Option<String>,
    /// Variables injected into the job container. Wins over `env_file`.
    pub env: BTreeMap<String, String>,
    /// `KEY=VALUE` file read when `env` is empty.
    pub env_file: Option<PathBuf>,
    /// Container path -> host path or named volume.
    pub volumes: BTreeMap<String, String>,
    /// Bounded wait for the container to exit; 0 waits forever.
    pub timeout_secs: u64,
    pub remove_image: bool,
    pub build_descriptor: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory: Some("4g".to_string()),
            memory_swap: None,
            cpu_period: Some(100_000),
            cpu_quota: Some(200_000),
            network: Some("job-network".to_string()),
            env: BTreeMap::new(),
            env_file: None,
            volumes: BTreeMap::new(),
            timeout_secs: 3600,
            remove_image: true,
            build_descriptor: "Dockerfile".to_string(),
        }
    }
}

/// Parse a Docker-style size: a byte count with an optional `b`, `k`, `m`
/// or `g` suffix. `-1` is passed through as "unlimited".
pub fn parse_size(raw: &str) -> Result<i64> {
    let s = raw.trim().to_ascii_lowercase();
    if s == "-1" {
        return Ok(-1);
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('b') => (&s[..s.len() - 1], 1),
        Some('k') => (&s[..s.len() - 1], 1 << 10),
        Some('m') => (&s[..s.len() - 1], 1 << 20),
        Some('g') => (&s[..s.len() - 1], 1 << 30),
        _ => (s.as_str(), 1),
    };
    let n: i64 = digits
        .parse()
        .with_context(|| format!("Invalid size '{}'", raw))?;
    if n < 0 {
        bail!("Invalid size '{}': must not be negative", raw);
    }
    n.checked_mul(multiplier)
        .with_context(|| format!("Size '{}' is too large", raw))
}

impl SandboxConfig {
    pub fn limits(&self) -> Result<ContainerLimits> {
        let memory = self.memory.as_deref().map(parse_size).transpose()?.unwrap_or(0);
        let memory_swap = match self.memory_swap.as_deref() {
            Some(raw) => parse_size(raw)?,
            None => memory,
        };
        if memory > 0 && memory_swap >= 0 && memory_swap < memory {
            bail!("memory_swap must be at least memory");
        }
        Ok(ContainerLimits {
            memory,
            memory_swap,
            cpu_period: self.cpu_period.unwrap_or(0),
            cpu_quota: self.cpu_quota.unwrap_or(0),
        })
    }

    /// Environment for job containers as `KEY=VALUE` pairs.
    pub fn job_env(&self) -> Result<Vec<String>> {
        if !self.env.is_empty() {
            return Ok(self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect());
        }
        let Some(path) = &self.env_file else {
            return Ok(Vec::new());
        };
        let entries = dotenvy::from_path_iter(path)
            .with_context(|| format!("Failed to read job env file {}", path.display()))?;
        entries
            .map(|entry| entry.map(|(k, v)| format!("{}={}", k, v)))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse job env file {}", path.display()))
    }

    pub fn binds(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|(container, source)| format!("{}:{}", source, container))
            .collect()
    }

    /// Non-fatal configuration problems worth reporting at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.env.is_empty() && self.env_file.is_none() {
            warnings.push("Neither sandbox.env nor sandbox.env_file is set".to_string());
        }
        if !self.env.is_empty() && self.env_file.is_some() {
            warnings.push(
                "Only one of sandbox.env and sandbox.env_file should be set; sandbox.env takes precedence"
                    .to_string(),
            );
        }
        if self.timeout_secs == 0 {
            warnings.push("sandbox.timeout_secs is 0: job containers may run forever".to_string());
        }
        warnings
    }
}

/// What came out of one container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builds a submitted archive into an image and runs it under limits.
pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    limits: ContainerLimits,
    env: Vec<String>,
    binds: Vec<String>,
}

impl Sandbox {
    /// Resolve limits and the job environment once, up front.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Result<Self> {
        let limits = config.limits().context("Invalid sandbox limits")?;
        let env = config.job_env()?;
        let binds = config.binds();
        Ok(Self {
            runtime,
            config,
            limits,
            env,
            binds,
        })
    }

    /// Extract, build, run and capture. The container, the image (when
    /// `remove_image` is set) and the scratch directory are removed on every
    /// path out of this function.
    pub async fn execute(&self, archive: &[u8]) -> Result<ExecutionOutcome, ExecutionError> {
        let workdir = tempfile::Builder::new().prefix("enclave-job-").tempdir()?;
        let root = workdir.path().to_path_buf();
        let bytes = archive.to_vec();
        let descriptor = self.config.build_descriptor.clone();
        let context = tokio::task::spawn_blocking(move || {
            extract_archive(&bytes, &root)?;
            let dir = find_build_context(&root, &descriptor)?;
            pack_context(&dir)
        })
        .await
        .map_err(|e| ExecutionError::RunFailed(format!("extraction task failed: {}", e)))??;
        drop(workdir);

        let run_id = Uuid::new_v4().simple().to_string();
        let tag = format!("enclave-job:{}-{}", digest(archive), &run_id[..8]);
        let name = format!("enclave-run-{}", run_id);

        let result = self.build_and_run(&tag, &name, context).await;

        if self.config.remove_image
            && let Err(e) = self.runtime.remove_image(&tag).await
        {
            warn!(tag = %tag, error = %e, "Failed to remove job image");
        }
        result
    }

    async fn build_and_run(
        &self,
        tag: &str,
        name: &str,
        context: Vec<u8>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        info!(tag, "Building job image");
        self.runtime
            .build_image(tag, &self.config.build_descriptor, context)
            .await?;

        let spec = RunSpec {
            image: tag.to_string(),
            name: name.to_string(),
            limits: self.limits,
            network: self.config.network.clone(),
            env: self.env.clone(),
            binds: self.binds.clone(),
        };
        let id = self.runtime.start_container(&spec).await?;
        info!(container = %id, "Job container started");

        let outcome = self.wait_and_capture(&id).await;

        if let Err(e) = self.runtime.remove_container(&id).await {
            warn!(container = %id, error = %e, "Failed to remove job container");
        }
        outcome
    }

    async fn wait_and_capture(&self, id: &str) -> Result<ExecutionOutcome, ExecutionError> {
        let wait = self.runtime.wait_container(id);
        let exit_code = if self.config.timeout_secs == 0 {
            wait.await?
        } else {
            let secs = self.config.timeout_secs;
            tokio::time::timeout(Duration::from_secs(secs), wait)
                .await
                .map_err(|_| ExecutionError::Timeout { secs })??
        };
        let logs = self.runtime.logs(id).await?;
        info!(container = %id, exit_code, "Job container exited");
        Ok(ExecutionOutcome {
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
        })
    }
}
