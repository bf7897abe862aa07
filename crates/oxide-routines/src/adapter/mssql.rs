//! SQL Server adapter.
//!
//! `CREATE PROCEDURE` and friends must be the first statement of a batch, so
//! scripts are split on `GO` separator lines and each batch is sent on its
//! own.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{
    check_transaction, closed_connection, validate_identifier, EngineAdapter, NativeResult,
    Record, Transaction, Value,
};
use crate::config::{ConnectionParams, Engine};
use crate::error::Result;
use crate::object::ObjectKind;

type MsSqlClient = Client<Compat<TcpStream>>;

const VERSION_QUERY: &str = "SELECT CASE
    WHEN CAST(SERVERPROPERTY('ProductMajorVersion') AS INT) >= 16 THEN '2022'
    WHEN CAST(SERVERPROPERTY('ProductMajorVersion') AS INT) = 14 THEN '2017'
    ELSE '2019'
END AS server_version";

const TABLE_DDL_QUERY: &str = "DECLARE @tableName NVARCHAR(128) = @P1;
DECLARE @sql NVARCHAR(MAX) = NULL;
IF OBJECT_ID(@tableName, 'U') IS NOT NULL
BEGIN
    SET @sql = 'CREATE TABLE ' + QUOTENAME(@tableName) + ' (';
    SELECT @sql = @sql + CHAR(10) + '    ' + QUOTENAME(c.name) + ' ' + t.name +
        CASE
            WHEN t.name IN ('varchar', 'char', 'varbinary', 'binary')
                THEN '(' + CASE WHEN c.max_length = -1 THEN 'MAX' ELSE CAST(c.max_length AS VARCHAR(10)) END + ')'
            WHEN t.name IN ('nvarchar', 'nchar')
                THEN '(' + CASE WHEN c.max_length = -1 THEN 'MAX' ELSE CAST(c.max_length / 2 AS VARCHAR(10)) END + ')'
            WHEN t.name IN ('decimal', 'numeric')
                THEN '(' + CAST(c.precision AS VARCHAR(10)) + ', ' + CAST(c.scale AS VARCHAR(10)) + ')'
            ELSE ''
        END +
        CASE WHEN c.is_nullable = 1 THEN ' NULL' ELSE ' NOT NULL' END + ','
    FROM sys.columns c
    JOIN sys.types t ON c.user_type_id = t.user_type_id
    WHERE c.object_id = OBJECT_ID(@tableName)
    ORDER BY c.column_id;
    SET @sql = LEFT(@sql, LEN(@sql) - 1) + CHAR(10) + ');';
END
SELECT @sql AS tabledef;";

/// Adapter over a single SQL Server session.
pub struct MsSqlAdapter {
    client: Mutex<Option<MsSqlClient>>,
    next_tx: AtomicU64,
}

impl MsSqlAdapter {
    /// Wraps an open client.
    #[must_use]
    pub fn new(client: MsSqlClient) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Opens a connection with the given parameters.
    ///
    /// # Errors
    ///
    /// Fails when the server is unreachable or rejects the login.
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let mut config = tiberius::Config::new();
        config.host(&params.host);
        config.port(params.port);
        config.database(&params.database);
        config.authentication(AuthMethod::sql_server(&params.user, &params.password));
        if params.trust_server_certificate {
            config.trust_cert();
        }

        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(Self::new(client))
    }

    async fn client(&self) -> Result<MappedMutexGuard<'_, MsSqlClient>> {
        MutexGuard::try_map(self.client.lock().await, Option::as_mut)
            .map_err(|_| closed_connection())
    }

    async fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<NativeResult> {
        debug!(sql = %sql, params = params.len(), "mssql query");
        let mut client = self.client().await?;
        let recordsets = client.query(sql, params).await?.into_results().await?;
        Ok(recordsets_result(recordsets))
    }

    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<NativeResult> {
        debug!(sql = %sql, params = params.len(), "mssql execute");
        let mut client = self.client().await?;
        let done = client.execute(sql, params).await?;
        Ok(NativeResult::MsSql {
            recordsets: Vec::new(),
            rows_affected: done.rows_affected().to_vec(),
        })
    }

    async fn simple(&self, sql: &str) -> Result<()> {
        debug!(sql = %sql, "mssql batch");
        let mut client = self.client().await?;
        client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

fn recordsets_result(recordsets: Vec<Vec<Row>>) -> NativeResult {
    let recordsets: Vec<Vec<Record>> = recordsets
        .iter()
        .map(|rows| rows.iter().map(record_from_row).collect())
        .collect();
    let rows_affected = recordsets.iter().map(|rows| rows.len() as u64).collect();
    NativeResult::MsSql {
        recordsets,
        rows_affected,
    }
}

fn record_from_row(row: &Row) -> Record {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(text) = row.try_get::<&str, usize>(idx) {
            text.map_or(Value::Null, |t| Value::Text(t.to_string()))
        } else if let Ok(int) = row.try_get::<i64, usize>(idx) {
            int.map_or(Value::Null, Value::Int)
        } else if let Ok(int) = row.try_get::<i32, usize>(idx) {
            int.map_or(Value::Null, |v| Value::Int(i64::from(v)))
        } else {
            Value::Null
        };
        record.push(column.name(), value);
    }
    record
}

fn escape(name: &str) -> Result<String> {
    Ok(format!("[{}]", validate_identifier(name)?.replace(']', "]]")))
}

/// Candidates travel as one newline-separated parameter; SQL Server caps a
/// request at 2100 parameters.
fn pending_query(table: &str) -> Result<String> {
    Ok(format!(
        "SELECT value AS pending_migration FROM STRING_SPLIT(@P1, NCHAR(10)) \
         WHERE value <> N'' \
         EXCEPT SELECT migration_name FROM dbo.{} \
         ORDER BY pending_migration ASC",
        escape(table)?
    ))
}

/// Joins candidate file names for [`pending_query`]. Names that would break
/// the list are skipped.
fn candidate_list(candidates: &[String]) -> String {
    candidates
        .iter()
        .map(String::as_str)
        .filter(|name| !name.is_empty() && !name.contains(['\n', '\r']))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits a script on `GO` separator lines (`GO` or `GO;`, any case).
///
/// Empty batches are dropped.
fn split_batches(sql: &str) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    for line in sql.lines() {
        let marker = line.trim().trim_end_matches(';');
        if marker.eq_ignore_ascii_case("go") {
            if !current.trim().is_empty() {
                batches.push(current.trim().to_string());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        batches.push(current.trim().to_string());
    }
    batches
}

#[async_trait]
impl EngineAdapter for MsSqlAdapter {
    fn engine(&self) -> Engine {
        Engine::MsSql
    }

    async fn engine_version(&self) -> Result<NativeResult> {
        self.query(VERSION_QUERY, &[]).await
    }

    async fn procedure_source(&self, name: &str) -> Result<NativeResult> {
        let qualified = format!("dbo.{}", validate_identifier(name)?);
        self.query(
            "SELECT OBJECT_DEFINITION(OBJECT_ID(@P1, 'P')) AS prosrc",
            &[&qualified],
        )
        .await
    }

    async fn function_source(&self, name: &str) -> Result<NativeResult> {
        let qualified = format!("dbo.{}", validate_identifier(name)?);
        self.query(
            "SELECT OBJECT_DEFINITION(OBJECT_ID(@P1)) AS funsrc \
             WHERE OBJECTPROPERTY(OBJECT_ID(@P1), 'IsScalarFunction') = 1 \
                OR OBJECTPROPERTY(OBJECT_ID(@P1), 'IsTableFunction') = 1",
            &[&qualified],
        )
        .await
    }

    async fn trigger_source(&self, name: &str, owner_table: Option<&str>) -> Result<NativeResult> {
        let name = validate_identifier(name)?;
        match owner_table {
            Some(table) => {
                let table = format!("dbo.{}", validate_identifier(table)?);
                self.query(
                    "SELECT OBJECT_DEFINITION(t.object_id) AS trigsrc FROM sys.triggers t \
                     WHERE t.name = @P1 AND t.parent_id = OBJECT_ID(@P2)",
                    &[&name, &table],
                )
                .await
            }
            None => {
                self.query(
                    "SELECT OBJECT_DEFINITION(t.object_id) AS trigsrc FROM sys.triggers t \
                     WHERE t.name = @P1",
                    &[&name],
                )
                .await
            }
        }
    }

    async fn table_ddl(&self, name: &str) -> Result<NativeResult> {
        let name = validate_identifier(name)?;
        self.query(TABLE_DDL_QUERY, &[&name]).await
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
        Ok(format!(
            "DROP {} IF EXISTS {};\nGO",
            kind.keyword(),
            escape(name)?
        ))
    }

    async fn create_temporary_table(&self, name: &str) -> Result<()> {
        let name = validate_identifier(name)?;
        let sql = format!(
            "IF OBJECT_ID(N'dbo.{name}', N'U') IS NULL CREATE TABLE {} (id INT IDENTITY(1,1) PRIMARY KEY);",
            escape(name)?
        );
        self.simple(&sql).await
    }

    async fn create_placeholder_function(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE OR ALTER FUNCTION dbo.{}() RETURNS INT AS BEGIN RETURN 0; END;",
            escape(name)?
        );
        self.simple(&sql).await
    }

    async fn list_procedures(&self) -> Result<NativeResult> {
        self.query(
            "SELECT p.name AS name, sm.definition AS source \
             FROM sys.procedures p \
             JOIN sys.sql_modules sm ON p.object_id = sm.object_id \
             WHERE p.is_ms_shipped = 0 \
             ORDER BY p.name",
            &[],
        )
        .await
    }

    async fn list_functions(&self) -> Result<NativeResult> {
        self.query(
            "SELECT o.name AS name, sm.definition AS source \
             FROM sys.objects o \
             JOIN sys.sql_modules sm ON o.object_id = sm.object_id \
             WHERE o.type IN ('FN', 'IF', 'TF') AND o.is_ms_shipped = 0 \
             ORDER BY o.name",
            &[],
        )
        .await
    }

    async fn list_triggers(&self) -> Result<NativeResult> {
        self.query(
            "SELECT t.name AS name, OBJECT_NAME(t.parent_id) AS owner_table, \
                    sm.definition AS source \
             FROM sys.triggers t \
             JOIN sys.sql_modules sm ON t.object_id = sm.object_id \
             WHERE t.is_ms_shipped = 0 AND t.parent_class = 1 \
             ORDER BY t.name",
            &[],
        )
        .await
    }

    async fn create_tracking_table(&self, table: &str) -> Result<()> {
        let name = validate_identifier(table)?;
        let sql = format!(
            "IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID(N'dbo.{name}') AND type = N'U')
BEGIN
    CREATE TABLE dbo.{escaped} (
        id INT IDENTITY(1,1) NOT NULL PRIMARY KEY,
        migration_name NVARCHAR(400) NOT NULL UNIQUE,
        migration_timestamp BIGINT NOT NULL
    );
END;",
            escaped = escape(name)?
        );
        self.simple(&sql).await
    }

    async fn pending_migrations(
        &self,
        candidates: &[String],
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MsSql, tx)?;
        let sql = pending_query(table)?;
        let list = candidate_list(candidates);
        if list.is_empty() {
            return Ok(NativeResult::empty(Engine::MsSql));
        }
        self.query(&sql, &[&list]).await
    }

    async fn most_recent_migration(
        &self,
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MsSql, tx)?;
        let sql = format!(
            "SELECT TOP 1 migration_name, migration_timestamp FROM dbo.{} \
             ORDER BY migration_timestamp DESC",
            escape(table)?
        );
        self.query(&sql, &[]).await
    }

    async fn insert_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        timestamp: i64,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MsSql, tx)?;
        let sql = format!(
            "INSERT INTO dbo.{} (migration_name, migration_timestamp) VALUES (@P1, @P2)",
            escape(table)?
        );
        self.execute(&sql, &[&migration_name, &timestamp]).await
    }

    async fn delete_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        check_transaction(Engine::MsSql, tx)?;
        let sql = format!(
            "DELETE FROM dbo.{} WHERE migration_name = @P1",
            escape(table)?
        );
        self.execute(&sql, &[&migration_name]).await
    }

    async fn begin_transaction(&self) -> Result<Transaction> {
        self.simple("BEGIN TRANSACTION").await?;
        Ok(Transaction::new(
            Engine::MsSql,
            self.next_tx.fetch_add(1, Ordering::Relaxed),
        ))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        check_transaction(Engine::MsSql, Some(&tx))?;
        self.simple("COMMIT TRANSACTION").await
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        check_transaction(Engine::MsSql, Some(&tx))?;
        self.simple("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }

    async fn run_statements(&self, sql: &str, tx: Option<&Transaction>) -> Result<NativeResult> {
        check_transaction(Engine::MsSql, tx)?;
        let mut rows_affected = Vec::new();
        for batch in split_batches(sql) {
            if let NativeResult::MsSql {
                rows_affected: counts,
                ..
            } = self.execute(&batch, &[]).await?
            {
                rows_affected.extend(counts);
            }
        }
        Ok(NativeResult::MsSql {
            recordsets: Vec::new(),
            rows_affected,
        })
    }

    fn escape_identifier(&self, name: &str) -> Result<String> {
        escape(name)
    }

    async fn preload_utilities(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await?;
        }
        Ok(())
    }
}
