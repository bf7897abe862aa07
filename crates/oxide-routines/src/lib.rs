//! Migrations for stored procedures, functions and triggers.
//!
//! `oxide-routines` keeps procedural database objects in plain `.sql` files
//! and turns edits to those files into reversible migrations for MySQL,
//! PostgreSQL and SQL Server:
//! - Candidate files are created in a disposable sandbox of the same engine
//!   and version, so the engine itself produces the canonical definition
//! - Canonical definitions are compared with what the live catalog reports
//! - Changed objects are written to one `{timestamp}_{name}.sql` file with
//!   `-- UP` and `-- DOWN` sections
//! - Pending migrations are applied in one transaction and tracked in a table
//!
//! # Architecture
//!
//! - **Adapter** - Engine-specific catalog queries, drop statements and
//!   transaction control behind [`adapter::EngineAdapter`]
//! - **Normalizer** - Reads engine-native results and strips engine noise
//! - **Sandbox** - Starts, seeds and tears down the disposable container
//! - **Diff** - Generates migration files
//! - **Apply / Rollback** - Runs the forward or reverse sections
//! - **Export** - Dumps every live object to files
//!
//! # CLI Usage
//!
//! ```bash
//! # Generate a migration from edited definitions
//! oxide-routines --config routines.toml generate add_audit_trigger
//!
//! # Apply pending migrations
//! oxide-routines --config routines.toml up
//!
//! # Revert the most recent migration
//! oxide-routines --config routines.toml down
//!
//! # Dump the live objects into files
//! oxide-routines --config routines.toml export ./dump
//! ```

pub mod adapter;
pub mod apply;
pub mod config;
pub mod connection;
pub mod diff;
pub mod error;
pub mod export;
pub mod migration_file;
pub mod normalizer;
pub mod object;
pub mod rollback;
pub mod sandbox;
pub mod sql;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::adapter::{EngineAdapter, NativeResult, Record, Transaction, Value};
    pub use crate::apply::{ApplyEngine, MigrationStatus};
    pub use crate::config::{Config, ConnectionParams, Engine};
    pub use crate::connection::{ConnectionProvider, DriverConnector};
    pub use crate::diff::{DiffEngine, StagedChange};
    pub use crate::error::{Result, RoutineError};
    pub use crate::export::ExportService;
    pub use crate::normalizer::{for_engine, ResultNormalizer};
    pub use crate::object::{ObjectKind, ProceduralObject, StatementKey, StatementObject};
    pub use crate::rollback::RollbackEngine;
    pub use crate::sandbox::{DockerCli, Sandbox};
}
