//! Engine adapters.
//!
//! Each supported engine implements [`EngineAdapter`], which hides how the
//! engine exposes routine source (catalog functions, `SHOW CREATE ...`,
//! `OBJECT_DEFINITION`), whether `CREATE OR REPLACE` exists, and whether
//! multi-statement batches are native. The diff, apply and rollback engines
//! only talk to this trait.

mod mssql;
mod mysql;
mod postgres;

pub use mssql::MsSqlAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;

#[cfg(test)]
pub(crate) use postgres::{
    drop_statement as postgres_drop_statement, escape as postgres_escape,
    placeholder_function_sql as postgres_placeholder_function_sql,
    temporary_table_sql as postgres_temporary_table_sql,
};

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::Engine;
use crate::error::{Result, RoutineError};
use crate::object::ObjectKind;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid identifier regex"));

/// A single column value as returned by a catalog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Integer column.
    Int(i64),
    /// Text column.
    Text(String),
}

/// One result row with named columns, in select order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a column in place.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Text value of a column, if present and not `NULL`.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Integer value of a column, if present and not `NULL`.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(value)) => Some(*value),
            Some(Value::Text(text)) => text.parse().ok(),
            _ => None,
        }
    }

    /// Column names in select order.
    #[must_use]
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}

/// Query result in the shape each driver family reports it.
///
/// Use a [`ResultNormalizer`](crate::normalizer::ResultNormalizer) to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeResult {
    /// MySQL: rows plus affected-row count.
    MySql {
        /// Returned rows.
        rows: Vec<Record>,
        /// Rows affected by the last statement.
        affected_rows: u64,
    },
    /// PostgreSQL: rows plus command row count.
    Postgres {
        /// Returned rows.
        rows: Vec<Record>,
        /// Rows returned or affected.
        row_count: u64,
    },
    /// SQL Server: one record set per result set, one count per statement.
    MsSql {
        /// Result sets.
        recordsets: Vec<Vec<Record>>,
        /// Affected rows per statement.
        rows_affected: Vec<u64>,
    },
}

impl NativeResult {
    /// An empty result of the engine's shape.
    #[must_use]
    pub fn empty(engine: Engine) -> Self {
        Self::from_rows(engine, Vec::new())
    }

    /// A result carrying `rows` in the engine's shape.
    #[must_use]
    pub fn from_rows(engine: Engine, rows: Vec<Record>) -> Self {
        let count = rows.len() as u64;
        match engine {
            Engine::MySql => Self::MySql {
                rows,
                affected_rows: 0,
            },
            Engine::Postgres => Self::Postgres {
                rows,
                row_count: count,
            },
            Engine::MsSql => Self::MsSql {
                recordsets: vec![rows],
                rows_affected: vec![count],
            },
        }
    }

    /// A result reporting `affected` rows and no data, in the engine's shape.
    #[must_use]
    pub fn affected(engine: Engine, affected: u64) -> Self {
        match engine {
            Engine::MySql => Self::MySql {
                rows: Vec::new(),
                affected_rows: affected,
            },
            Engine::Postgres => Self::Postgres {
                rows: Vec::new(),
                row_count: affected,
            },
            Engine::MsSql => Self::MsSql {
                recordsets: Vec::new(),
                rows_affected: vec![affected],
            },
        }
    }
}

/// Handle for an open transaction on an adapter's session.
///
/// All calls belonging to one logical operation take the same handle;
/// [`EngineAdapter::commit`] and [`EngineAdapter::rollback`] consume it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a transaction must be committed or rolled back"]
pub struct Transaction {
    engine: Engine,
    id: u64,
}

impl Transaction {
    /// Creates a handle; only adapters open transactions.
    pub(crate) const fn new(engine: Engine, id: u64) -> Self {
        Self { engine, id }
    }

    /// Engine the transaction belongs to.
    #[must_use]
    pub const fn engine(&self) -> Engine {
        self.engine
    }

    /// Session-local transaction number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Capability contract every engine implements.
///
/// Introspection methods return the engine-native result; a missing object
/// yields an empty result rather than an error. Methods that take object or
/// table names validate them with [`validate_identifier`] before any SQL is
/// sent.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// The engine this adapter talks to.
    fn engine(&self) -> Engine;

    /// Server version (`server_version` column).
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn engine_version(&self) -> Result<NativeResult>;

    /// Source of a stored procedure.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn procedure_source(&self, name: &str) -> Result<NativeResult>;

    /// Source of a stored function.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn function_source(&self, name: &str) -> Result<NativeResult>;

    /// Source of a trigger, optionally scoped to its owning table.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn trigger_source(&self, name: &str, owner_table: Option<&str>) -> Result<NativeResult>;

    /// `CREATE TABLE` statement for a table.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn table_ddl(&self, name: &str) -> Result<NativeResult>;

    /// Idempotent drop prefix for an object.
    ///
    /// Engines whose `CREATE OR REPLACE` already replaces the object may
    /// return an empty string unless `ensure_drop` is set.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    fn drop_statement(
        &self,
        name: &str,
        kind: ObjectKind,
        owner_table: Option<&str>,
        ensure_drop: bool,
    ) -> Result<String>;

    /// Creates a minimal table so a trigger can be attached to it.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn create_temporary_table(&self, name: &str) -> Result<()>;

    /// Creates a no-op function so a trigger referencing it can be created.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn create_placeholder_function(&self, name: &str) -> Result<()>;

    /// All procedures (`name`, `source` columns).
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn list_procedures(&self) -> Result<NativeResult>;

    /// All functions (`name`, `source` columns).
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn list_functions(&self) -> Result<NativeResult>;

    /// All triggers (`name`, `owner_table`, `source` columns).
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn list_triggers(&self) -> Result<NativeResult>;

    /// Creates the tracking table if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn create_tracking_table(&self, table: &str) -> Result<()>;

    /// Candidates without a tracking record (`pending_migration` column),
    /// ascending.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn pending_migrations(
        &self,
        candidates: &[String],
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult>;

    /// Record with the highest timestamp (`migration_name`,
    /// `migration_timestamp` columns).
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn most_recent_migration(
        &self,
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult>;

    /// Inserts a tracking record.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn insert_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        timestamp: i64,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult>;

    /// Deletes a tracking record.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names, or when
    /// the engine rejects the statement.
    async fn delete_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult>;

    /// Opens a transaction on this adapter's session.
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn begin_transaction(&self) -> Result<Transaction>;

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// Fails when `tx` is not the open transaction or the engine rejects it.
    async fn commit(&self, tx: Transaction) -> Result<()>;

    /// Rolls back a transaction.
    ///
    /// # Errors
    ///
    /// Fails when `tx` is not the open transaction or the engine rejects it.
    async fn rollback(&self, tx: Transaction) -> Result<()>;

    /// Executes one or more statements.
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn run_statements(&self, sql: &str, tx: Option<&Transaction>) -> Result<NativeResult>;

    /// Validates and quotes an identifier.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutineError::InvalidIdentifier`] for unsafe names.
    fn escape_identifier(&self, name: &str) -> Result<String>;

    /// Installs helper routines needed for introspection.
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects the statement or the connection is
    /// closed.
    async fn preload_utilities(&self) -> Result<()>;

    /// Closes the underlying connection.
    ///
    /// # Errors
    ///
    /// Fails when the driver cannot shut the session down cleanly.
    async fn close(&self) -> Result<()>;
}

/// Checks `name` against `^[A-Za-z_][A-Za-z0-9_-]*$`.
///
/// # Errors
///
/// Returns [`RoutineError::InvalidIdentifier`] when the name does not match.
pub fn validate_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(RoutineError::InvalidIdentifier(name.to_string()))
    }
}

/// Ensures a transaction handle was opened by an adapter of `engine`.
pub(crate) fn check_transaction(engine: Engine, tx: Option<&Transaction>) -> Result<()> {
    match tx {
        Some(tx) if tx.engine() != engine => Err(RoutineError::statement(format!(
            "transaction {} belongs to {}, not {}",
            tx.id(),
            tx.engine(),
            engine
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn closed_connection() -> RoutineError {
    RoutineError::statement("connection is closed")
}
