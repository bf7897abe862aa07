//! Error types for routine migrations.

use std::path::PathBuf;

/// Failure raised by a database driver or by a statement the adapter
/// refused to run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// MySQL / PostgreSQL driver error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// SQL Server driver error.
    #[error(transparent)]
    Tiberius(#[from] tiberius::error::Error),

    /// A statement failed without a driver error (e.g. unexpected result shape).
    #[error("{0}")]
    Statement(String),
}

/// Errors that can occur while diffing, applying or reverting routines.
#[derive(Debug, thiserror::Error)]
pub enum RoutineError {
    /// The configured engine is not one of `mysql`, `postgres`, `mssql`.
    #[error("Unsupported database engine: {0}")]
    UnsupportedEngine(String),

    /// An identifier failed validation before being interpolated into SQL.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A trigger definition has no `ON <table>` clause.
    #[error("Source table not found for trigger '{trigger}'")]
    MissingOwnerTable {
        /// Trigger name derived from the candidate file.
        trigger: String,
    },

    /// A candidate file ran in the sandbox but did not create the object it
    /// is named after.
    #[error("Candidate for {kind} '{name}' did not create it in the sandbox")]
    ObjectNotCreated {
        /// Object kind.
        kind: String,
        /// Object name derived from the candidate file.
        name: String,
    },

    /// The disposable sandbox instance could not be started or reached.
    #[error("Failed to provision sandbox: {0}")]
    SandboxProvision(String),

    /// Any SQL execution error against the live database or the sandbox.
    #[error("SQL execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// Commit or rollback failed; the transaction state is indeterminate.
    #[error("Transaction {action} failed: {source}")]
    Transaction {
        /// `commit` or `rollback`.
        action: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<RoutineError>,
    },

    /// A tracked migration has no file on disk.
    #[error("Migration file not found: {0}")]
    MigrationFileMissing(PathBuf),

    /// Configuration could not be loaded or is incomplete.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file is not valid TOML.
    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error (reading candidates, writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RoutineError {
    /// Wraps a commit/rollback failure.
    pub(crate) fn transaction(action: &'static str, source: Self) -> Self {
        Self::Transaction {
            action,
            source: Box::new(source),
        }
    }

    /// Shorthand for a statement-level execution failure.
    pub(crate) fn statement(message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::Statement(message.into()))
    }
}

impl From<sqlx::Error> for RoutineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Execution(ExecutionError::Sqlx(err))
    }
}

impl From<tiberius::error::Error> for RoutineError {
    fn from(err: tiberius::error::Error) -> Self {
        Self::Execution(ExecutionError::Tiberius(err))
    }
}

/// Result type for routine operations.
pub type Result<T> = std::result::Result<T, RoutineError>;
