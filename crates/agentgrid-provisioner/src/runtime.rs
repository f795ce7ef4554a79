//! Container runtime: lifecycle calls against the container engine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::render::descriptor_path;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no container descriptor at {0}")]
    DescriptorMissing(PathBuf),

    #[error("no container for tenant {0}")]
    NotFound(String),

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code:?}: {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

/// Observed container state, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    NotFound,
    Unknown(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            other => ContainerState::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => f.write_str("created"),
            ContainerState::Running => f.write_str("running"),
            ContainerState::Paused => f.write_str("paused"),
            ContainerState::Restarting => f.write_str("restarting"),
            ContainerState::Exited => f.write_str("exited"),
            ContainerState::Dead => f.write_str("dead"),
            ContainerState::NotFound => f.write_str("not_found"),
            ContainerState::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// Name of a tenant's container, shared with the descriptor templates.
pub fn container_name(tenant_id: &str) -> String {
    format!("agentgrid-{tenant_id}")
}

/// Container lifecycle for one tenant at a time.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the container. Fails if no descriptor has been rendered.
    async fn create(&self, tenant_id: &str) -> RuntimeResult<()>;
    async fn start(&self, tenant_id: &str) -> RuntimeResult<()>;
    async fn stop(&self, tenant_id: &str) -> RuntimeResult<()>;
    /// Remove the container and its volumes. Removing an absent
    /// container succeeds.
    async fn remove(&self, tenant_id: &str) -> RuntimeResult<()>;
    async fn status(&self, tenant_id: &str) -> RuntimeResult<ContainerState>;
}

/// Runs `docker compose -f <tenant>/docker-compose.yml ...`.
///
/// Child processes are killed if the awaiting future is dropped.
#[derive(Debug, Clone)]
pub struct DockerComposeRuntime {
    tenants_dir: PathBuf,
    docker: PathBuf,
}

impl DockerComposeRuntime {
    pub fn new(tenants_dir: impl Into<PathBuf>) -> Self {
        Self {
            tenants_dir: tenants_dir.into(),
            docker: PathBuf::from("docker"),
        }
    }

    /// Use a different engine binary.
    pub fn with_binary(mut self, docker: impl Into<PathBuf>) -> Self {
        self.docker = docker.into();
        self
    }

    fn descriptor(&self, tenant_id: &str) -> PathBuf {
        descriptor_path(&self.tenants_dir, tenant_id)
    }

    async fn compose(&self, tenant_id: &str, args: &[&str]) -> RuntimeResult<()> {
        let descriptor = self.descriptor(tenant_id);
        let descriptor_arg = descriptor.to_string_lossy().into_owned();
        let mut full = vec!["compose", "-f", descriptor_arg.as_str()];
        full.extend_from_slice(args);

        let workdir = descriptor.parent().unwrap_or(Path::new("."));
        let output = self.run(&full, Some(workdir)).await?;
        if !output.status.success() {
            return Err(self.failure(&full, &output));
        }
        Ok(())
    }

    async fn run(&self, args: &[&str], workdir: Option<&Path>) -> RuntimeResult<std::process::Output> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        debug!(command = %self.describe(args), "running container engine");
        cmd.output().await.map_err(|source| RuntimeError::Spawn {
            command: self.describe(args),
            source,
        })
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.docker.display(), args.join(" "))
    }

    fn failure(&self, args: &[&str], output: &std::process::Output) -> RuntimeError {
        let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim());
        }
        RuntimeError::CommandFailed {
            command: self.describe(args),
            code: output.status.code(),
            output: text,
        }
    }

    fn require_descriptor(&self, tenant_id: &str) -> RuntimeResult<()> {
        if self.descriptor(tenant_id).exists() {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(tenant_id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerComposeRuntime {
    async fn create(&self, tenant_id: &str) -> RuntimeResult<()> {
        let descriptor = self.descriptor(tenant_id);
        if !descriptor.exists() {
            return Err(RuntimeError::DescriptorMissing(descriptor));
        }
        self.compose(tenant_id, &["create"]).await
    }

    async fn start(&self, tenant_id: &str) -> RuntimeResult<()> {
        self.require_descriptor(tenant_id)?;
        self.compose(tenant_id, &["up", "-d"]).await
    }

    async fn stop(&self, tenant_id: &str) -> RuntimeResult<()> {
        self.require_descriptor(tenant_id)?;
        self.compose(tenant_id, &["stop"]).await
    }

    async fn remove(&self, tenant_id: &str) -> RuntimeResult<()> {
        if !self.descriptor(tenant_id).exists() {
            debug!(%tenant_id, "no descriptor, nothing to remove");
            return Ok(());
        }
        self.compose(tenant_id, &["down", "-v"]).await
    }

    async fn status(&self, tenant_id: &str) -> RuntimeResult<ContainerState> {
        let name = container_name(tenant_id);
        let args = ["inspect", "-f", "{{.State.Status}}", name.as_str()];
        let output = self.run(&args, None).await?;
        match output.status.code() {
            Some(0) => Ok(ContainerState::parse(&String::from_utf8_lossy(&output.stdout))),
            // `docker inspect` exits 1 for an unknown container.
            Some(1) => Ok(ContainerState::NotFound),
            _ => Err(self.failure(&args, &output)),
        }
    }
}
