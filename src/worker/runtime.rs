//! Container runtime capability.
//!
//! The sandbox only talks to containers through [`ContainerRuntime`];
//! [`DockerRuntime`] is the production implementation on top of bollard.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    WaitContainerOptions,
};
use futures_util::StreamExt;
use tracing::debug;

use crate::errors::ExecutionError;

/// Per-container resource bounds, in Docker's units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerLimits {
    /// Bytes; 0 means unlimited.
    pub memory: i64,
    /// Memory plus swap in bytes; -1 means unlimited swap.
    pub memory_swap: i64,
    /// Microseconds.
    pub cpu_period: i64,
    /// Microseconds of CPU time per period.
    pub cpu_quota: i64,
}

/// Everything needed to start one job container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub limits: ContainerLimits,
    pub network: Option<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
}

/// Captured container output, kept as separate streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `context` (an uncompressed tar) into an image tagged `tag`.
    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        context: Vec<u8>,
    ) -> Result<(), ExecutionError>;

    /// Create and start a detached container; returns its id.
    async fn start_container(&self, spec: &RunSpec) -> Result<String, ExecutionError>;

    /// Block until the container exits; returns its exit status.
    async fn wait_container(&self, id: &str) -> Result<i64, ExecutionError>;

    async fn logs(&self, id: &str) -> Result<CapturedLogs, ExecutionError>;

    /// Force-remove a container; removing one that is already gone succeeds.
    async fn remove_container(&self, id: &str) -> Result<(), ExecutionError>;

    async fn remove_image(&self, tag: &str) -> Result<(), ExecutionError>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect through the local socket or `DOCKER_HOST`.
    pub fn connect() -> Result<Self, ExecutionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutionError::RunFailed(format!("Docker unavailable: {}", e)))?;
        Ok(Self::new(docker))
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        context: Vec<u8>,
    ) -> Result<(), ExecutionError> {
        let options = BuildImageOptionsBuilder::new()
            .dockerfile(dockerfile)
            .t(tag)
            .rm(true)
            .forcerm(true)
            .build();
        let mut stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(bytes::Bytes::from(context))));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| ExecutionError::BuildFailed(e.to_string()))?;
            if let Some(error) = info.error_detail {
                return Err(ExecutionError::BuildFailed(error.message.unwrap_or_default()));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag, "{}", line);
                }
            }
        }
        Ok(())
    }

    async fn start_container(&self, spec: &RunSpec) -> Result<String, ExecutionError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            host_config: Some(HostConfig {
                memory: Some(spec.limits.memory),
                memory_swap: Some(spec.limits.memory_swap),
                cpu_period: Some(spec.limits.cpu_period),
                cpu_quota: Some(spec.limits.cpu_quota),
                network_mode: spec.network.clone(),
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| ExecutionError::RunFailed(format!("create_container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let _ = self.remove_container(&created.id).await;
            return Err(ExecutionError::RunFailed(format!("start_container: {}", e)));
        }
        Ok(created.id)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ExecutionError> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a nonzero exit status as an error.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(ExecutionError::RunFailed(format!("wait_container: {}", e))),
            None => Err(ExecutionError::RunFailed(
                "wait_container: stream ended without an exit status".into(),
            )),
        }
    }

    async fn logs(&self, id: &str) -> Result<CapturedLogs, ExecutionError> {
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut captured = CapturedLogs::default();
        while let Some(item) = stream.next().await {
            match item.map_err(|e| ExecutionError::RunFailed(format!("logs: {}", e)))? {
                LogOutput::StdErr { message } => captured.stderr.extend_from_slice(&message),
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    captured.stdout.extend_from_slice(&message)
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(captured)
    }

    async fn remove_container(&self, id: &str) -> Result<(), ExecutionError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ExecutionError::RunFailed(format!("remove_container: {}", e))),
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<(), ExecutionError> {
        let options = RemoveImageOptionsBuilder::new().force(true).build();
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ExecutionError::RunFailed(format!("remove_image: {}", e))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "conflict".into(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
    }

    #[test]
    fn test_run_spec_defaults_are_unbounded() {
        let spec = RunSpec::default();
        assert_eq!(spec.limits.memory, 0);
        assert!(spec.network.is_none());
        assert!(spec.env.is_empty());
    }
}
