//! Opening engine connections.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::adapter::{EngineAdapter, MsSqlAdapter, MySqlAdapter, PostgresAdapter};
use crate::config::{ConnectionParams, Engine};
use crate::error::Result;

/// Opens an adapter for an engine.
///
/// The sandbox orchestrator connects through this trait as well, so the
/// live database and the sandbox are reached the same way.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Connects to `engine` with `params`.
    ///
    /// # Errors
    ///
    /// Fails when the server is unreachable.
    async fn connect(
        &self,
        engine: Engine,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn EngineAdapter>>;
}

/// Connects with the native drivers (sqlx for MySQL and PostgreSQL,
/// tiberius for SQL Server).
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverConnector;

#[async_trait]
impl ConnectionProvider for DriverConnector {
    async fn connect(
        &self,
        engine: Engine,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn EngineAdapter>> {
        debug!(
            engine = %engine,
            host = %params.host,
            port = params.port,
            database = %params.database,
            "Connecting"
        );
        let adapter: Arc<dyn EngineAdapter> = match engine {
            Engine::MySql => Arc::new(MySqlAdapter::connect(params).await?),
            Engine::Postgres => Arc::new(PostgresAdapter::connect(params).await?),
            Engine::MsSql => Arc::new(MsSqlAdapter::connect(params).await?),
        };
        Ok(adapter)
    }
}
