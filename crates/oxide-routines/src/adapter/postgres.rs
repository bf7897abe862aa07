//! PostgreSQL adapter.
//!
//! Sources come from `pg_get_functiondef` / `pg_get_triggerdef`, which emit
//! `CREATE OR REPLACE` for routines. Table definitions are rebuilt by a
//! helper function installed into the session's `pg_temp` schema, so the
//! target database itself is never altered.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection, Executor, Row};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use super::{
    check_transaction, closed_connection, validate_identifier, EngineAdapter, NativeResult,
    Record, Transaction, Value,
};
use crate::config::{ConnectionParams, Engine};
use crate::error::Result;
use crate::object::ObjectKind;

const TABLE_DDL_HELPER: &str = r"
CREATE OR REPLACE FUNCTION pg_temp.generate_create_table_statement(p_table_name varchar)
  RETURNS text AS
$BODY$
DECLARE
    v_table_ddl   text;
    column_record record;
BEGIN
    FOR column_record IN
        SELECT
            b.nspname AS schema_name,
            b.relname AS table_name,
            a.attname AS column_name,
            pg_catalog.format_type(a.atttypid, a.atttypmod) AS column_type,
            CASE WHEN d.adbin IS NOT NULL
                  AND pg_catalog.pg_get_expr(d.adbin, d.adrelid) NOT LIKE 'nextval(%'
                THEN 'DEFAULT ' || pg_catalog.pg_get_expr(d.adbin, d.adrelid)
                ELSE ''
            END AS column_default_value,
            CASE WHEN a.attnotnull THEN 'NOT NULL' ELSE 'NULL' END AS column_not_null
        FROM pg_catalog.pg_attribute a
        INNER JOIN (
            SELECT c.oid, n.nspname, c.relname
            FROM pg_catalog.pg_class c
            LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = p_table_name
              AND c.relkind IN ('r', 'p')
              AND pg_catalog.pg_table_is_visible(c.oid)
        ) b ON a.attrelid = b.oid
        LEFT JOIN pg_catalog.pg_attrdef d
            ON d.adrelid = a.attrelid AND d.adnum = a.attnum AND a.atthasdef
        WHERE a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum
    LOOP
        IF v_table_ddl IS NULL THEN
            v_table_ddl := 'CREATE TABLE IF NOT EXISTS '
                || quote_ident(column_record.table_name) || ' (';
        ELSE
            v_table_ddl := v_table_ddl || ',';
        END IF;
        v_table_ddl := v_table_ddl || chr(10) || '    '
            || quote_ident(column_record.column_name) || ' '
            || column_record.column_type || ' '
            || column_record.column_default_value || ' '
            || column_record.column_not_null;
    END LOOP;

    IF v_table_ddl IS NOT NULL THEN
        v_table_ddl := v_table_ddl || chr(10) || ');';
    END IF;
    RETURN v_table_ddl;
END;
$BODY$
LANGUAGE plpgsql;
";

/// Adapter over a single PostgreSQL session.
pub struct PostgresAdapter {
    conn: Mutex<Option<PgConnection>>,
    next_tx: AtomicU64,
}

impl PostgresAdapter {
    /// Wraps an open connection.
    #[must_use]
    pub fn new(conn: PgConnection) -> Self {
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
        let options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .password(&params.password)
            .database(&params.database);
        let conn = PgConnection::connect_with(&options).await?;
        Ok(Self::new(conn))
    }

    async fn connection(&self) -> Result<MappedMutexGuard<'_, PgConnection>> {
        MutexGuard::try_map(self.conn.lock().await, Option::as_mut).map_err(|_| closed_connection())
    }

    /// Runs a query with a single text parameter.
    async fn fetch_by_name(&self, sql: &str, name: &str) -> Result<NativeResult> {
        debug!(sql = %sql, name, "postgres query");
        let mut conn = self.connection().await?;
        let rows = sqlx::query(sql).bind(name).fetch_all(&mut *conn).await?;
        Ok(rows_result(&rows))
    }

    async fn fetch(&self, sql: &str) -> Result<NativeResult> {
        debug!(sql = %sql, "postgres query");
        let mut conn = self.connection().await?;
        let rows = (&mut *conn).fetch_all(sqlx::raw_sql(sql)).await?;
        Ok(rows_result(&rows))
    }

    async fn execute(&self, sql: &str) -> Result<NativeResult> {
        debug!(sql = %sql, "postgres execute");
        let mut conn = self.connection().await?;
        let done = (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(NativeResult::affected(Engine::Postgres, done.rows_affected()))
    }
}

fn rows_result(rows: &[PgRow]) -> NativeResult {
    NativeResult::from_rows(Engine::Postgres, rows.iter().map(record_from_row).collect())
}

fn record_from_row(row: &PgRow) -> Record {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(text) = row.try_get::<Option<String>, _>(idx) {
            text.map_or(Value::Null, Value::Text)
        } else if let Ok(int) = row.try_get::<Option<i64>, _>(idx) {
            int.map_or(Value::Null, Value::Int)
        } else if let Ok(int) = row.try_get::<Option<i32>, _>(idx) {
            int.map_or(Value::Null, |v| Value::Int(i64::from(v)))
        } else {
            Value::Null
        };
        record.push(column.name(), value);
    }
    record
}

/// Quotes an identifier with double quotes.
///
/// # Errors
///
/// Fails when `name` is not a safe identifier.
pub fn escape(name: &str) -> Result<String> {
    Ok(format!("\"{}\"", validate_identifier(name)?.replace('"', "\"\"")))
}

/// Drop prefix for an object.
///
/// `pg_get_functiondef` emits `CREATE OR REPLACE`, so routines only get an
/// explicit drop when `ensure_drop` is set (the object is absent on one
/// side and must be removed when reverting).
pub fn drop_statement(
    name: &str,
    kind: ObjectKind,
    owner_table: Option<&str>,
    ensure_drop: bool,
) -> Result<String> {
    let name = escape(name)?;
    match (kind, owner_table) {
        (ObjectKind::Trigger, Some(table)) => {
            Ok(format!("DROP TRIGGER IF EXISTS {name} ON {};", escape(table)?))
        }
        (ObjectKind::Trigger, None) => Ok(String::new()),
        (_, _) if ensure_drop => Ok(format!("DROP {} IF EXISTS {name};", kind.keyword())),
        _ => Ok(String::new()),
    }
}

/// Trigger function that simply returns the new row.
///
/// # Errors
///
/// Fails when `name` is not a safe identifier.
pub fn placeholder_function_sql(name: &str) -> Result<String> {
    Ok(format!(
        "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS $$\nBEGIN\n    RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql;",
        escape(name)?
    ))
}

/// Minimal table a trigger can be attached to.
///
/// # Errors
///
/// Fails when `name` is not a safe identifier.
pub fn temporary_table_sql(name: &str) -> Result<String> {
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY);",
        escape(name)?
    ))
}

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn engine_version(&self) -> Result<NativeResult> {
        self.fetch("SHOW server_version").await
    }

    async fn procedure_source(&self, name: &str) -> Result<NativeResult> {
        validate_identifier(name)?;
        self.fetch_by_name(
            "SELECT pg_catalog.pg_get_functiondef(p.oid) AS prosrc \
             FROM pg_catalog.pg_proc p \
             WHERE p.proname = $1 AND p.prokind = 'p' \
               AND pg_catalog.pg_function_is_visible(p.oid) \
             LIMIT 1",
            name,
        )
        .await
    }

    async fn function_source(&self, name: &str) -> Result<NativeResult> {
        validate_identifier(name)?;
        self.fetch_by_name(
            "SELECT pg_catalog.pg_get_functiondef(p.oid) AS funsrc \
             FROM pg_catalog.pg_proc p \
             WHERE p.proname = $1 AND p.prokind = 'f' \
               AND pg_catalog.pg_function_is_visible(p.oid) \
             LIMIT 1",
            name,
        )
        .await
    }

    async fn trigger_source(&self, name: &str, owner_table: Option<&str>) -> Result<NativeResult> {
        validate_identifier(name)?;
        let Some(table) = owner_table else {
            return self
                .fetch_by_name(
                    "SELECT pg_catalog.pg_get_triggerdef(t.oid) AS trigsrc \
                     FROM pg_catalog.pg_trigger t \
                     WHERE t.tgname = $1 AND NOT t.tgisinternal \
                     LIMIT 1",
                    name,
                )
                .await;
        };
        validate_identifier(table)?;

        let sql = "SELECT pg_catalog.pg_get_triggerdef(t.oid) AS trigsrc \
                   FROM pg_catalog.pg_trigger t \
                   JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid \
                   WHERE t.tgname = $1 AND c.relname = $2 AND NOT t.tgisinternal \
                     AND pg_catalog.pg_table_is_visible(c.oid)";
        debug!(sql = %sql, name, table, "postgres query");
        let mut conn = self.connection().await?;
        let rows = sqlx::query(sql)
            .bind(name)
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows_result(&rows))
    }

    async fn table_ddl(&self, name: &str) -> Result<NativeResult> {
        validate_identifier(name)?;
        self.fetch_by_name(
            "SELECT pg_temp.generate_create_table_statement($1) AS tabledef",
            name,
        )
        .await
    }

    fn drop_statement(
        &self,
        name: &str,
        kind: ObjectKind,
        owner_table: Option<&str>,
        ensure_drop: bool,
    ) -> Result<String> {
        drop_statement(name, kind, owner_table, ensure_drop)
    }

    async fn create_temporary_table(&self, name: &str) -> Result<()> {
        self.execute(&temporary_table_sql(name)?).await.map(|_| ())
    }

    async fn create_placeholder_function(&self, name: &str) -> Result<()> {
        self.execute(&placeholder_function_sql(name)?)
            .await
            .map(|_| ())
    }

    async fn list_procedures(&self) -> Result<NativeResult> {
        self.fetch(
            "SELECT p.proname AS name, pg_catalog.pg_get_functiondef(p.oid) AS source \
             FROM pg_catalog.pg_proc p \
             JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
             WHERE p.prokind = 'p' \
               AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY p.proname",
        )
        .await
    }

    async fn list_functions(&self) -> Result<NativeResult> {
        self.fetch(
            "SELECT p.proname AS name, pg_catalog.pg_get_functiondef(p.oid) AS source \
             FROM pg_catalog.pg_proc p \
             JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
             WHERE p.prokind = 'f' \
               AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
               AND n.nspname NOT LIKE 'pg_temp%' \
               AND NOT EXISTS (SELECT 1 FROM pg_catalog.pg_depend d \
                               WHERE d.objid = p.oid AND d.deptype = 'e') \
             ORDER BY p.proname",
        )
        .await
    }

    async fn list_triggers(&self) -> Result<NativeResult> {
        self.fetch(
            "SELECT t.tgname AS name, c.relname AS owner_table, \
                    pg_catalog.pg_get_triggerdef(t.oid) AS source \
             FROM pg_catalog.pg_trigger t \
             JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE NOT t.tgisinternal \
               AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY t.tgname, c.relname",
        )
        .await
    }

    async fn create_tracking_table(&self, table: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
    id SERIAL NOT NULL PRIMARY KEY,
    migration_name TEXT NOT NULL,
    migration_timestamp BIGINT NOT NULL,
    UNIQUE (migration_name)
);",
            escape(table)?
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn pending_migrations(
        &self,
        candidates: &[String],
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::Postgres, tx)?;
        let sql = format!(
            "SELECT unnest($1::text[]) AS pending_migration \
             EXCEPT SELECT migration_name FROM {} \
             ORDER BY pending_migration ASC",
            escape(table)?
        );
        if candidates.is_empty() {
            return Ok(NativeResult::empty(Engine::Postgres));
        }
        debug!(sql = %sql, candidates = candidates.len(), "postgres query");
        let mut conn = self.connection().await?;
        let rows = sqlx::query(&sql)
            .bind(candidates.to_vec())
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows_result(&rows))
    }

    async fn most_recent_migration(
        &self,
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::Postgres, tx)?;
        let sql = format!(
            "SELECT migration_name, migration_timestamp FROM {} \
             ORDER BY migration_timestamp DESC LIMIT 1",
            escape(table)?
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
        check_transaction(Engine::Postgres, tx)?;
        let sql = format!(
            "INSERT INTO {} (migration_name, migration_timestamp) VALUES ($1, $2)",
            escape(table)?
        );
        let mut conn = self.connection().await?;
        let done = sqlx::query(&sql)
            .bind(migration_name)
            .bind(timestamp)
            .execute(&mut *conn)
            .await?;
        Ok(NativeResult::affected(Engine::Postgres, done.rows_affected()))
    }

    async fn delete_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::Postgres, tx)?;
        let sql = format!(
            "DELETE FROM {} WHERE migration_name = $1",
            escape(table)?
        );
        let mut conn = self.connection().await?;
        let done = sqlx::query(&sql)
            .bind(migration_name)
            .execute(&mut *conn)
            .await?;
        Ok(NativeResult::affected(Engine::Postgres, done.rows_affected()))
    }

    async fn begin_transaction(&self) -> Result<Transaction> {
        self.execute("BEGIN").await?;
        Ok(Transaction::new(
            Engine::Postgres,
            self.next_tx.fetch_add(1, Ordering::Relaxed),
        ))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        check_transaction(Engine::Postgres, Some(&tx))?;
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        check_transaction(Engine::Postgres, Some(&tx))?;
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn run_statements(&self, sql: &str, tx: Option<&Transaction>) -> Result<NativeResult> {
        check_transaction(Engine::Postgres, tx)?;
        if sql.trim().is_empty() {
            return Ok(NativeResult::affected(Engine::Postgres, 0));
        }
        self.execute(sql).await
    }

    fn escape_identifier(&self, name: &str) -> Result<String> {
        escape(name)
    }

    async fn preload_utilities(&self) -> Result<()> {
        self.execute(TABLE_DDL_HELPER).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
