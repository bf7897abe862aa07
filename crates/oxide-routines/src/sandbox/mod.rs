//! Disposable sandbox instances.
//!
//! A sandbox is a throwaway container of the same engine family and version
//! as the live database. Candidate definitions are created there so the
//! engine itself produces the canonical form that is compared against the
//! live catalog.

mod docker;

pub use docker::{ContainerHandle, ContainerRuntime, ContainerSpec, DockerCli};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::adapter::EngineAdapter;
use crate::config::{ConnectionParams, Engine};
use crate::connection::ConnectionProvider;
use crate::error::{Result, RoutineError};
use crate::normalizer::ResultNormalizer;

/// Password for the sandbox administrator (SQL Server requires complexity).
pub const SANDBOX_PASSWORD: &str = "Sandbox_Passw0rd!";

/// Database created inside MySQL and PostgreSQL sandboxes.
pub const SANDBOX_DATABASE: &str = "sandbox";

/// Lifecycle of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Nothing started yet.
    Uninitialized,
    /// Container started, not yet reachable.
    Provisioning,
    /// Session open.
    Connected,
    /// Helper routines installed.
    Seeded,
    /// Session closed and container removed.
    TornDown,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Bounded wait for a freshly started engine to accept connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Connection attempts before giving up.
    pub attempts: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(2),
        }
    }
}

/// Leading dotted version number of a server version string
/// (`16.2 (Debian 16.2-1)` -> `16.2`).
fn leading_version(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let version = raw[..end].trim_end_matches('.');
    (!version.is_empty()).then_some(version)
}

/// Container to start for a live server reporting `raw_version`.
///
/// # Errors
///
/// Returns [`RoutineError::SandboxProvision`] when no version can be read
/// from `raw_version`.
pub fn container_spec(engine: Engine, raw_version: &str) -> Result<ContainerSpec> {
    let version = leading_version(raw_version).ok_or_else(|| {
        RoutineError::SandboxProvision(format!(
            "cannot determine {engine} version from {raw_version:?}"
        ))
    })?;
    let env = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    };

    let spec = match engine {
        Engine::MySql => {
            let family = if raw_version.to_ascii_lowercase().contains("mariadb") {
                "mariadb"
            } else {
                "mysql"
            };
            ContainerSpec {
                image: format!("{family}:{version}"),
                env: env(&[
                    ("MYSQL_ROOT_PASSWORD", SANDBOX_PASSWORD),
                    ("MYSQL_DATABASE", SANDBOX_DATABASE),
                ]),
                args: vec!["--log-bin-trust-function-creators=1".to_string()],
                container_port: engine.default_port(),
            }
        }
        Engine::Postgres => ContainerSpec {
            image: format!("postgres:{version}-alpine"),
            env: env(&[
                ("POSTGRES_PASSWORD", SANDBOX_PASSWORD),
                ("POSTGRES_DB", SANDBOX_DATABASE),
            ]),
            args: Vec::new(),
            container_port: engine.default_port(),
        },
        Engine::MsSql => ContainerSpec {
            image: format!("mcr.microsoft.com/mssql/server:{version}-latest"),
            env: env(&[
                ("ACCEPT_EULA", "Y"),
                ("MSSQL_SA_PASSWORD", SANDBOX_PASSWORD),
            ]),
            args: Vec::new(),
            container_port: engine.default_port(),
        },
    };
    Ok(spec)
}

/// Connection parameters for a sandbox published on `port`.
#[must_use]
pub fn sandbox_params(engine: Engine, port: u16) -> ConnectionParams {
    let (user, database) = match engine {
        Engine::MySql => ("root", SANDBOX_DATABASE),
        Engine::Postgres => ("postgres", SANDBOX_DATABASE),
        Engine::MsSql => ("sa", "master"),
    };
    ConnectionParams {
        host: "127.0.0.1".to_string(),
        port,
        user: user.to_string(),
        password: SANDBOX_PASSWORD.to_string(),
        database: database.to_string(),
        trust_server_certificate: true,
    }
}

/// Ephemeral engine instance used as the canonicalization oracle.
pub struct Sandbox {
    engine: Engine,
    runtime: Arc<dyn ContainerRuntime>,
    provider: Arc<dyn ConnectionProvider>,
    readiness: Readiness,
    state: SandboxState,
    container: Option<ContainerHandle>,
    params: Option<ConnectionParams>,
    adapter: Option<Arc<dyn EngineAdapter>>,
}

impl Sandbox {
    /// Creates an uninitialized sandbox.
    #[must_use]
    pub fn new(
        engine: Engine,
        runtime: Arc<dyn ContainerRuntime>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            engine,
            runtime,
            provider,
            readiness: Readiness::default(),
            state: SandboxState::Uninitialized,
            container: None,
            params: None,
            adapter: None,
        }
    }

    /// Overrides the readiness wait.
    #[must_use]
    pub const fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SandboxState {
        self.state
    }

    fn expect_state(&self, expected: SandboxState, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RoutineError::SandboxProvision(format!(
                "cannot {action}: sandbox is {}, expected {expected}",
                self.state
            )))
        }
    }

    /// Starts a container matching the live server's engine and version.
    ///
    /// # Errors
    ///
    /// Fails when called twice, when the live server reports no version, or
    /// when the container cannot be started.
    pub async fn initialize(
        &mut self,
        live: &dyn EngineAdapter,
        normalizer: &dyn ResultNormalizer,
    ) -> Result<()> {
        self.expect_state(SandboxState::Uninitialized, "initialize")?;
        self.state = SandboxState::Provisioning;

        let version = live.engine_version().await?;
        let raw_version = normalizer
            .first_row(&version)
            .and_then(|row| row.text("server_version"))
            .ok_or_else(|| {
                RoutineError::SandboxProvision("live server did not report a version".to_string())
            })?
            .to_string();
        let spec = container_spec(self.engine, &raw_version)?;

        info!(image = %spec.image, "Starting sandbox container");
        let container = self.runtime.start(&spec).await?;
        debug!(container = %container.id, "Sandbox container started");
        self.container = Some(container.clone());

        let port = self.runtime.host_port(&container, spec.container_port).await?;
        self.params = Some(sandbox_params(self.engine, port));
        Ok(())
    }

    /// Connects to the sandbox, retrying until the engine accepts sessions.
    ///
    /// # Errors
    ///
    /// Fails when the sandbox was not provisioned or never accepts a session.
    pub async fn connect(&mut self) -> Result<Arc<dyn EngineAdapter>> {
        self.expect_state(SandboxState::Provisioning, "connect")?;
        let params = self.params.clone().ok_or_else(|| {
            RoutineError::SandboxProvision("sandbox has no published port".to_string())
        })?;

        let attempts = self.readiness.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.provider.connect(self.engine, &params).await {
                Ok(adapter) => {
                    info!(attempt, "Connected to sandbox");
                    self.adapter = Some(Arc::clone(&adapter));
                    self.state = SandboxState::Connected;
                    return Ok(adapter);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Sandbox not ready yet");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.readiness.interval).await;
                    }
                }
            }
        }
        Err(RoutineError::SandboxProvision(format!(
            "sandbox did not accept connections after {attempts} attempts: {}",
            last_error.map_or_else(String::new, |e| e.to_string())
        )))
    }

    /// Installs the helper routines the live adapter relies on.
    ///
    /// # Errors
    ///
    /// Fails when the sandbox is not connected or the helpers are rejected.
    pub async fn preload_utilities(&mut self) -> Result<()> {
        self.expect_state(SandboxState::Connected, "preload utilities")?;
        self.adapter()?.preload_utilities().await?;
        self.state = SandboxState::Seeded;
        Ok(())
    }

    /// Adapter connected to the sandbox.
    ///
    /// # Errors
    ///
    /// Fails when the sandbox is not connected.
    pub fn adapter(&self) -> Result<Arc<dyn EngineAdapter>> {
        self.adapter.clone().ok_or_else(|| {
            RoutineError::SandboxProvision(format!("sandbox is {}, not connected", self.state))
        })
    }

    /// Closes the session and removes the container. Safe to call in any
    /// state; the first failure is returned after both steps ran.
    ///
    /// # Errors
    ///
    /// Returns the first failure of closing the session or removing the
    /// container.
    pub async fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Some(adapter) = self.adapter.take() {
            if let Err(e) = adapter.close().await {
                warn!(error = %e, "Failed to close sandbox connection");
                first_error.get_or_insert(e);
            }
        }
        if let Some(container) = self.container.take() {
            info!(container = %container.id, "Stopping sandbox container");
            if let Err(e) = self.runtime.stop(&container).await {
                error!(container = %container.id, error = %e, "Failed to stop sandbox container");
                first_error.get_or_insert(e);
            }
        }
        self.state = SandboxState::TornDown;
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(container) = &self.container {
            error!(
                container = %container.id,
                "Sandbox dropped without teardown; container is still running"
            );
        }
    }
}
