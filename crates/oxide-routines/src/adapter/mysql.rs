//! MySQL adapter.
//!
//! Routine source comes from `SHOW CREATE ...`; there is no
//! `CREATE OR REPLACE` for routines, so every drop prefix is a real
//! `DROP ... IF EXISTS`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::{Column, Connection, Executor, Row};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use super::{
    check_transaction, closed_connection, validate_identifier, EngineAdapter, NativeResult,
    Record, Transaction, Value,
};
use crate::config::{ConnectionParams, Engine};
use crate::error::Result;
use crate::normalizer::{MySqlNormalizer, ResultNormalizer};
use crate::object::ObjectKind;

/// `ER_SP_DOES_NOT_EXIST`, `ER_TRG_DOES_NOT_EXIST`, `ER_NO_SUCH_TABLE`.
const MISSING_OBJECT_ERRORS: [u16; 3] = [1305, 1360, 1146];

/// Adapter over a single MySQL session.
pub struct MySqlAdapter {
    conn: Mutex<Option<MySqlConnection>>,
    next_tx: AtomicU64,
}

impl MySqlAdapter {
    /// Wraps an open connection.
    #[must_use]
    pub fn new(conn: MySqlConnection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Opens a connection with the given parameters.
    ///
    /// # Errors
    ///
    /// Fails when the server is unreachable or rejects the login.
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .password(&params.password)
            .database(&params.database);
        let conn = MySqlConnection::connect_with(&options).await?;
        Ok(Self::new(conn))
    }

    async fn connection(&self) -> Result<MappedMutexGuard<'_, MySqlConnection>> {
        MutexGuard::try_map(self.conn.lock().await, Option::as_mut).map_err(|_| closed_connection())
    }

    async fn fetch(&self, sql: &str) -> Result<NativeResult> {
        debug!(sql = %sql, "mysql query");
        let mut conn = self.connection().await?;
        let rows = (&mut *conn).fetch_all(sqlx::raw_sql(sql)).await?;
        Ok(NativeResult::from_rows(
            Engine::MySql,
            rows.iter().map(record_from_row).collect(),
        ))
    }

    /// Like [`Self::fetch`], but a missing object yields an empty result.
    async fn fetch_optional(&self, sql: &str) -> Result<NativeResult> {
        debug!(sql = %sql, "mysql query");
        let mut conn = self.connection().await?;
        match (&mut *conn).fetch_all(sqlx::raw_sql(sql)).await {
            Ok(rows) => Ok(NativeResult::from_rows(
                Engine::MySql,
                rows.iter().map(record_from_row).collect(),
            )),
            Err(err) if is_missing_object(&err) => Ok(NativeResult::empty(Engine::MySql)),
            Err(err) => Err(err.into()),
        }
    }

    async fn execute(&self, sql: &str) -> Result<NativeResult> {
        debug!(sql = %sql, "mysql execute");
        let mut conn = self.connection().await?;
        let done = (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(NativeResult::affected(Engine::MySql, done.rows_affected()))
    }

    /// Runs `SHOW CREATE {kind}` for every name listed by `list_sql`.
    async fn inventory(&self, list_sql: &str, kind: ObjectKind) -> Result<NativeResult> {
        let listed = self.fetch(list_sql).await?;
        let NativeResult::MySql { rows, .. } = listed else {
            return Ok(NativeResult::empty(Engine::MySql));
        };

        let mut inventory = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(name) = row.text("name") else {
                continue;
            };
            let show = format!(
                "SHOW CREATE {} {}",
                kind.keyword(),
                self.escape_identifier(name)?
            );
            let created = self.fetch_optional(&show).await?;
            let NativeResult::MySql { rows: created, .. } = created else {
                continue;
            };
            let Some(source) = created
                .first()
                .and_then(|r| r.text(MySqlNormalizer.source_column(kind.statement_key())))
                .map(str::to_string)
            else {
                continue;
            };
            let mut record = Record::new().with("name", Value::Text(name.to_string()));
            if let Some(table) = row.text("owner_table") {
                record.push("owner_table", Value::Text(table.to_string()));
            }
            record.push("source", Value::Text(source));
            inventory.push(record);
        }
        Ok(NativeResult::from_rows(Engine::MySql, inventory))
    }
}

fn escape(name: &str) -> Result<String> {
    Ok(format!("`{}`", validate_identifier(name)?.replace('`', "``")))
}

fn drop_sql(name: &str, kind: ObjectKind) -> Result<String> {
    Ok(format!("DROP {} IF EXISTS {};", kind.keyword(), escape(name)?))
}

fn is_missing_object(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|e| MISSING_OBJECT_ERRORS.contains(&e.number())),
        _ => false,
    }
}

fn record_from_row(row: &MySqlRow) -> Record {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(text) = row.try_get::<Option<String>, _>(idx) {
            text.map_or(Value::Null, Value::Text)
        } else if let Ok(int) = row.try_get::<Option<i64>, _>(idx) {
            int.map_or(Value::Null, Value::Int)
        } else if let Ok(uint) = row.try_get::<Option<u64>, _>(idx) {
            uint.and_then(|v| i64::try_from(v).ok())
                .map_or(Value::Null, Value::Int)
        } else if let Ok(bytes) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            // SHOW CREATE returns some columns with a binary collation.
            bytes.map_or(Value::Null, |b| {
                Value::Text(String::from_utf8_lossy(&b).into_owned())
            })
        } else {
            Value::Null
        };
        record.push(column.name(), value);
    }
    record
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    async fn engine_version(&self) -> Result<NativeResult> {
        self.fetch("SELECT VERSION() AS server_version").await
    }

    async fn procedure_source(&self, name: &str) -> Result<NativeResult> {
        let sql = format!("SHOW CREATE PROCEDURE {}", self.escape_identifier(name)?);
        self.fetch_optional(&sql).await
    }

    async fn function_source(&self, name: &str) -> Result<NativeResult> {
        let sql = format!("SHOW CREATE FUNCTION {}", self.escape_identifier(name)?);
        self.fetch_optional(&sql).await
    }

    async fn trigger_source(&self, name: &str, owner_table: Option<&str>) -> Result<NativeResult> {
        // Trigger names are unique per schema.
        if let Some(table) = owner_table {
            validate_identifier(table)?;
        }
        let sql = format!("SHOW CREATE TRIGGER {}", self.escape_identifier(name)?);
        self.fetch_optional(&sql).await
    }

    async fn table_ddl(&self, name: &str) -> Result<NativeResult> {
        let sql = format!("SHOW CREATE TABLE {}", self.escape_identifier(name)?);
        self.fetch_optional(&sql).await
    }

    fn drop_statement(
        &self,
        name: &str,
        kind: ObjectKind,
        owner_table: Option<&str>,
        _ensure_drop: bool,
    ) -> Result<String> {
        if let Some(table) = owner_table {
            validate_identifier(table)?;
        }
        drop_sql(name, kind)
    }

    async fn create_temporary_table(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY);",
            self.escape_identifier(name)?
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn create_placeholder_function(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE FUNCTION IF NOT EXISTS {}() RETURNS INT DETERMINISTIC RETURN 0;",
            self.escape_identifier(name)?
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn list_procedures(&self) -> Result<NativeResult> {
        self.inventory(
            "SELECT ROUTINE_NAME AS name FROM information_schema.ROUTINES \
             WHERE ROUTINE_TYPE = 'PROCEDURE' AND ROUTINE_SCHEMA = DATABASE() \
             ORDER BY ROUTINE_NAME",
            ObjectKind::Procedure,
        )
        .await
    }

    async fn list_functions(&self) -> Result<NativeResult> {
        self.inventory(
            "SELECT ROUTINE_NAME AS name FROM information_schema.ROUTINES \
             WHERE ROUTINE_TYPE = 'FUNCTION' AND ROUTINE_SCHEMA = DATABASE() \
             ORDER BY ROUTINE_NAME",
            ObjectKind::Function,
        )
        .await
    }

    async fn list_triggers(&self) -> Result<NativeResult> {
        self.inventory(
            "SELECT TRIGGER_NAME AS name, EVENT_OBJECT_TABLE AS owner_table \
             FROM information_schema.TRIGGERS WHERE TRIGGER_SCHEMA = DATABASE() \
             ORDER BY TRIGGER_NAME",
            ObjectKind::Trigger,
        )
        .await
    }

    async fn create_tracking_table(&self, table: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
    id SERIAL NOT NULL PRIMARY KEY,
    migration_name VARCHAR(400) NOT NULL,
    migration_timestamp BIGINT NOT NULL,
    UNIQUE (migration_name)
);",
            self.escape_identifier(table)?
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn pending_migrations(
        &self,
        candidates: &[String],
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MySql, tx)?;
        let table = self.escape_identifier(table)?;
        if candidates.is_empty() {
            return Ok(NativeResult::empty(Engine::MySql));
        }

        let selects = vec!["SELECT ? AS pending_migration"; candidates.len()].join(" UNION ALL ");
        let sql = format!(
            "SELECT pending_migration FROM ({selects}) AS candidates \
             WHERE NOT EXISTS (SELECT 1 FROM {table} AS applied \
             WHERE applied.migration_name = candidates.pending_migration) \
             ORDER BY pending_migration ASC"
        );
        debug!(sql = %sql, "mysql query");

        let mut query = sqlx::query(&sql);
        for candidate in candidates {
            query = query.bind(candidate.as_str());
        }
        let mut conn = self.connection().await?;
        let rows = query.fetch_all(&mut *conn).await?;
        Ok(NativeResult::from_rows(
            Engine::MySql,
            rows.iter().map(record_from_row).collect(),
        ))
    }

    async fn most_recent_migration(
        &self,
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MySql, tx)?;
        let sql = format!(
            "SELECT migration_name, migration_timestamp FROM {} \
             ORDER BY migration_timestamp DESC LIMIT 1",
            self.escape_identifier(table)?
        );
        self.fetch(&sql).await
    }

    async fn insert_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        timestamp: i64,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MySql, tx)?;
        let sql = format!(
            "INSERT INTO {} (migration_name, migration_timestamp) VALUES (?, ?)",
            self.escape_identifier(table)?
        );
        let mut conn = self.connection().await?;
        let done = sqlx::query(&sql)
            .bind(migration_name)
            .bind(timestamp)
            .execute(&mut *conn)
            .await?;
        Ok(NativeResult::affected(Engine::MySql, done.rows_affected()))
    }

    async fn delete_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MySql, tx)?;
        let sql = format!(
            "DELETE FROM {} WHERE migration_name = ?",
            self.escape_identifier(table)?
        );
        let mut conn = self.connection().await?;
        let done = sqlx::query(&sql)
            .bind(migration_name)
            .execute(&mut *conn)
            .await?;
        Ok(NativeResult::affected(Engine::MySql, done.rows_affected()))
    }

    async fn begin_transaction(&self) -> Result<Transaction> {
        self.execute("START TRANSACTION").await?;
        Ok(Transaction::new(
            Engine::MySql,
            self.next_tx.fetch_add(1, Ordering::Relaxed),
        ))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        check_transaction(Engine::MySql, Some(&tx))?;
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        check_transaction(Engine::MySql, Some(&tx))?;
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn run_statements(&self, sql: &str, tx: Option<&Transaction>) -> Result<NativeResult> {
        check_transaction(Engine::MySql, tx)?;
        if sql.trim().is_empty() {
            return Ok(NativeResult::affected(Engine::MySql, 0));
        }
        self.execute(sql).await
    }

    fn escape_identifier(&self, name: &str) -> Result<String> {
        escape(name)
    }

    async fn preload_utilities(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
