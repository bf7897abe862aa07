//! Container runtime backed by the `docker` CLI.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, RoutineError};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference, e.g. `postgres:16.2-alpine`.
    pub image: String,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Arguments passed to the image entrypoint.
    pub args: Vec<String>,
    /// Port the engine listens on inside the container.
    pub container_port: u16,
}

/// A started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Runtime-assigned identifier.
    pub id: String,
}

/// Starts and stops disposable containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts a container with its port published on a random loopback port.
    ///
    /// # Errors
    ///
    /// Returns [`RoutineError::SandboxProvision`] when the runtime refuses.
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Host port mapped to `container_port`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutineError::SandboxProvision`] when the port is not published.
    async fn host_port(&self, container: &ContainerHandle, container_port: u16) -> Result<u16>;

    /// Stops and removes a container.
    ///
    /// # Errors
    ///
    /// Returns [`RoutineError::SandboxProvision`] when the runtime refuses.
    async fn stop(&self, container: &ContainerHandle) -> Result<()>;
}

/// Drives the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Uses `program` as the docker executable.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(program = %self.program, args = ?args, "Running container command");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RoutineError::SandboxProvision(format!("cannot run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(RoutineError::SandboxProvision(format!(
                "{} {} failed: {}",
                self.program,
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Builds the `docker run` argument list.
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--rm".to_string(),
        "--publish".to_string(),
        format!("127.0.0.1::{}", spec.container_port),
    ];
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Parses `docker port` output (`127.0.0.1:49153`, possibly several lines).
fn parse_port_mapping(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let id = self.run(&run_args(spec)).await?;
        if id.is_empty() {
            return Err(RoutineError::SandboxProvision(
                "container runtime returned no container id".to_string(),
            ));
        }
        Ok(ContainerHandle { id })
    }

    async fn host_port(&self, container: &ContainerHandle, container_port: u16) -> Result<u16> {
        let output = self
            .run(&[
                "port".to_string(),
                container.id.clone(),
                format!("{container_port}/tcp"),
            ])
            .await?;
        parse_port_mapping(&output).ok_or_else(|| {
            RoutineError::SandboxProvision(format!(
                "no host port published for {container_port}/tcp: {output:?}"
            ))
        })
    }

    async fn stop(&self, container: &ContainerHandle) -> Result<()> {
        self.run(&["rm".to_string(), "--force".to_string(), container.id.clone()])
            .await
            .map(|_| ())
    }
}
