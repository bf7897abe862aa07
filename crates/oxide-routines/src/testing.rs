//! In-memory doubles for tests: a PostgreSQL-flavoured adapter, a container
//! runtime and a connection provider.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;

use crate::adapter::{
    check_transaction, closed_connection, postgres_drop_statement, postgres_escape,
    postgres_placeholder_function_sql, postgres_temporary_table_sql, validate_identifier,
    EngineAdapter, NativeResult, Record, Transaction, Value,
};
use crate::config::{Concurrency, Config, ConnectionParams, Engine, DEFAULT_MIGRATIONS_TABLE};
use crate::connection::ConnectionProvider;
use crate::error::{Result, RoutineError};
use crate::object::ObjectKind;
use crate::sandbox::{ContainerHandle, ContainerRuntime, ContainerSpec};
use crate::sql::{extract_function_name, extract_owner_table, extract_trigger_name};

const ENGINE: Engine = Engine::Postgres;

static STATEMENT_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^[ \t]*(?:CREATE|DROP)\b").expect("statement regex"));

static CREATE_ROUTINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^CREATE\s+(OR\s+REPLACE\s+)?(PROCEDURE|FUNCTION)\s+("?)([A-Za-z0-9_]+)"?(.*)$"#)
        .expect("routine regex")
});

static CREATE_TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^CREATE\s+(OR\s+REPLACE\s+)?TRIGGER\b").expect("trigger regex")
});

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?("?)([A-Za-z0-9_]+)"?"#)
        .expect("table regex")
});

static DROP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^DROP\s+(PROCEDURE|FUNCTION|TRIGGER|TABLE)\s+(IF\s+EXISTS\s+)?("?)([A-Za-z0-9_]+)"?(?:\s+ON\s+("?)([A-Za-z0-9_]+)"?)?"#,
    )
    .expect("drop regex")
});

/// Unquoted names resolve in lower case, quoted ones as written.
fn fold(quote: &str, name: &str) -> String {
    if quote.is_empty() {
        name.to_ascii_lowercase()
    } else {
        name.to_string()
    }
}

/// Configuration rooted at `dir` for a PostgreSQL live database.
pub fn test_config(dir: &Path) -> Config {
    Config {
        engine: ENGINE,
        migrations_directory: dir.join("migrations"),
        procedures_directory: dir.join("procedures"),
        functions_directory: dir.join("functions"),
        triggers_directory: dir.join("triggers"),
        migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        prefer_replace: false,
        connection: ConnectionParams {
            host: "localhost".to_string(),
            port: ENGINE.default_port(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "app".to_string(),
            trust_server_certificate: false,
        },
        concurrency: Concurrency::default(),
    }
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    procedures: BTreeMap<String, String>,
    functions: BTreeMap<String, String>,
    triggers: BTreeMap<(String, String), String>,
    tables: BTreeMap<String, String>,
    records: Vec<(String, i64)>,
}

impl Catalog {
    fn routines(&mut self, kind: &str) -> &mut BTreeMap<String, String> {
        if kind.eq_ignore_ascii_case("procedure") {
            &mut self.procedures
        } else {
            &mut self.functions
        }
    }

    fn apply(&mut self, statement: &str) -> Result<()> {
        let statement = statement.trim();
        if let Some(caps) = CREATE_ROUTINE.captures(statement) {
            let keyword = caps[2].to_ascii_uppercase();
            let name = fold(&caps[3], &caps[4]);
            let routines = self.routines(&keyword);
            if caps.get(1).is_none() && routines.contains_key(&name) {
                return Err(RoutineError::statement(format!("{name} already exists")));
            }
            let canonical = format!("CREATE OR REPLACE {keyword} {name}{}", &caps[5]);
            routines.insert(name, strip_terminator(&canonical));
        } else if CREATE_TRIGGER.is_match(statement) {
            let name = extract_trigger_name(statement)
                .ok_or_else(|| RoutineError::statement("trigger without a name"))?;
            let table = extract_owner_table(statement)
                .ok_or_else(|| RoutineError::statement("trigger without a table"))?;
            if !self.tables.contains_key(&table) {
                return Err(RoutineError::statement(format!(
                    "relation \"{table}\" does not exist"
                )));
            }
            if let Some(function) = extract_function_name(statement) {
                if !self.functions.contains_key(&function) {
                    return Err(RoutineError::statement(format!(
                        "function {function}() does not exist"
                    )));
                }
            }
            let key = (name, table);
            if CREATE_TRIGGER.captures(statement).is_some_and(|c| c.get(1).is_none())
                && self.triggers.contains_key(&key)
            {
                return Err(RoutineError::statement(format!("trigger {} already exists", key.0)));
            }
            self.triggers.insert(key, strip_terminator(statement));
        } else if let Some(caps) = CREATE_TABLE.captures(statement) {
            let name = fold(&caps[2], &caps[3]);
            if self.tables.contains_key(&name) {
                if caps.get(1).is_none() {
                    return Err(RoutineError::statement(format!(
                        "relation \"{name}\" already exists"
                    )));
                }
                return Ok(());
            }
            self.tables.insert(name, strip_terminator(statement));
        } else if let Some(caps) = DROP.captures(statement) {
            let kind = caps[1].to_ascii_uppercase();
            let if_exists = caps.get(2).is_some();
            let name = fold(&caps[3], &caps[4]);
            let removed = match kind.as_str() {
                "TRIGGER" => {
                    let table = caps
                        .get(6)
                        .map_or_else(String::new, |m| fold(&caps[5], m.as_str()));
                    self.triggers.remove(&(name.clone(), table)).is_some()
                }
                "TABLE" => {
                    self.triggers.retain(|(_, table), _| *table != name);
                    self.tables.remove(&name).is_some()
                }
                routine => self.routines(routine).remove(&name).is_some(),
            };
            if !removed && !if_exists {
                return Err(RoutineError::statement(format!("{name} does not exist")));
            }
        }
        Ok(())
    }
}

fn strip_terminator(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim_end().to_string()
}

/// Splits a script at lines starting with `CREATE` or `DROP`.
fn split_statements(sql: &str) -> Vec<&str> {
    let starts: Vec<usize> = STATEMENT_START.find_iter(sql).map(|m| m.start()).collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| &sql[start..starts.get(i + 1).copied().unwrap_or(sql.len())])
        .filter(|statement| !statement.trim().is_empty())
        .collect()
}

#[derive(Debug, Default)]
struct State {
    catalog: Catalog,
    snapshot: Option<Catalog>,
    executed: Vec<String>,
    fail_on: Vec<String>,
    utilities_loaded: bool,
    closed: bool,
}

/// Emulates a PostgreSQL session: catalog, tracking records and
/// snapshot-based transactions.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    state: Mutex<State>,
    next_tx: AtomicU64,
}

impl MemoryAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("state lock")
    }

    fn open(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state();
        if state.closed {
            return Err(closed_connection());
        }
        Ok(state)
    }

    /// Applies statements without recording them or honouring `fail_on`.
    pub fn seed(&self, sql: &str) {
        let mut state = self.state();
        for statement in split_statements(sql) {
            state.catalog.apply(statement).expect("seed statement");
        }
    }

    pub fn seed_record(&self, name: &str, timestamp: i64) {
        let mut state = self.state();
        state
            .catalog
            .tables
            .entry(DEFAULT_MIGRATIONS_TABLE.to_string())
            .or_default();
        state.catalog.records.push((name.to_string(), timestamp));
    }

    pub fn records(&self) -> Vec<(String, i64)> {
        self.state().catalog.records.clone()
    }

    /// Scripts passed to `run_statements`, trimmed.
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Makes `run_statements` fail for any script containing `marker`.
    pub fn fail_on(&self, marker: &str) {
        self.state().fail_on.push(marker.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn utilities_loaded(&self) -> bool {
        self.state().utilities_loaded
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state().catalog.tables.contains_key(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.state().catalog.functions.contains_key(name)
    }

    fn execute(&self, sql: &str, tx: Option<&Transaction>) -> Result<NativeResult> {
        check_transaction(ENGINE, tx)?;
        let mut state = self.open()?;
        state.executed.push(sql.trim().to_string());
        if let Some(marker) = state.fail_on.iter().find(|m| sql.contains(m.as_str())) {
            return Err(RoutineError::statement(format!("simulated failure at {marker}")));
        }
        for statement in split_statements(sql) {
            state.catalog.apply(statement)?;
        }
        Ok(NativeResult::affected(ENGINE, 0))
    }

    fn source(&self, column: &str, found: Option<String>) -> NativeResult {
        let rows = found
            .map(|source| vec![Record::new().with(column, Value::Text(source))])
            .unwrap_or_default();
        NativeResult::from_rows(ENGINE, rows)
    }

    fn lookup(&self, name: &str, read: impl FnOnce(&Catalog) -> Option<String>) -> Result<Option<String>> {
        validate_identifier(name)?;
        Ok(read(&self.open()?.catalog))
    }

    fn tracked(&self, table: &str, tx: Option<&Transaction>) -> Result<MutexGuard<'_, State>> {
        validate_identifier(table)?;
        check_transaction(ENGINE, tx)?;
        let state = self.open()?;
        if !state.catalog.tables.contains_key(table) {
            return Err(RoutineError::statement(format!(
                "relation \"{table}\" does not exist"
            )));
        }
        Ok(state)
    }

    fn listing(rows: impl Iterator<Item = (String, String, Option<String>)>) -> NativeResult {
        let rows = rows
            .map(|(name, source, table)| {
                Record::new()
                    .with("name", Value::Text(name))
                    .with("source", Value::Text(source))
                    .with("owner_table", table.map_or(Value::Null, Value::Text))
            })
            .collect();
        NativeResult::from_rows(ENGINE, rows)
    }
}

#[async_trait]
impl EngineAdapter for MemoryAdapter {
    fn engine(&self) -> Engine {
        ENGINE
    }

    async fn engine_version(&self) -> Result<NativeResult> {
        self.open()?;
        Ok(NativeResult::from_rows(
            ENGINE,
            vec![Record::new().with("server_version", Value::Text("16.2".to_string()))],
        ))
    }

    async fn procedure_source(&self, name: &str) -> Result<NativeResult> {
        let found = self.lookup(name, |c| c.procedures.get(name).cloned())?;
        Ok(self.source("prosrc", found))
    }

    async fn function_source(&self, name: &str) -> Result<NativeResult> {
        let found = self.lookup(name, |c| c.functions.get(name).cloned())?;
        Ok(self.source("funsrc", found))
    }

    async fn trigger_source(&self, name: &str, owner_table: Option<&str>) -> Result<NativeResult> {
        let found = self.lookup(name, |c| {
            c.triggers
                .iter()
                .find(|((trigger, table), _)| {
                    trigger == name && owner_table.map_or(true, |owner| owner == table)
                })
                .map(|(_, source)| source.clone())
        })?;
        Ok(self.source("trigsrc", found))
    }

    async fn table_ddl(&self, name: &str) -> Result<NativeResult> {
        let found = self.lookup(name, |c| c.tables.get(name).cloned())?;
        Ok(self.source("tabledef", found))
    }

    fn drop_statement(
        &self,
        name: &str,
        kind: ObjectKind,
        owner_table: Option<&str>,
        ensure_drop: bool,
    ) -> Result<String> {
        postgres_drop_statement(name, kind, owner_table, ensure_drop)
    }

    async fn create_temporary_table(&self, name: &str) -> Result<()> {
        self.run_statements(&postgres_temporary_table_sql(name)?, None)
            .await
            .map(|_| ())
    }

    async fn create_placeholder_function(&self, name: &str) -> Result<()> {
        self.run_statements(&postgres_placeholder_function_sql(name)?, None)
            .await
            .map(|_| ())
    }

    async fn list_procedures(&self) -> Result<NativeResult> {
        let state = self.open()?;
        Ok(Self::listing(
            state
                .catalog
                .procedures
                .iter()
                .map(|(name, source)| (name.clone(), source.clone(), None)),
        ))
    }

    async fn list_functions(&self) -> Result<NativeResult> {
        let state = self.open()?;
        Ok(Self::listing(
            state
                .catalog
                .functions
                .iter()
                .map(|(name, source)| (name.clone(), source.clone(), None)),
        ))
    }

    async fn list_triggers(&self) -> Result<NativeResult> {
        let state = self.open()?;
        Ok(Self::listing(state.catalog.triggers.iter().map(
            |((name, table), source)| (name.clone(), source.clone(), Some(table.clone())),
        )))
    }

    async fn create_tracking_table(&self, table: &str) -> Result<()> {
        let ddl = postgres_temporary_table_sql(table)?;
        let mut state = self.open()?;
        state.catalog.tables.entry(table.to_string()).or_insert(ddl);
        Ok(())
    }

    async fn pending_migrations(
        &self,
        candidates: &[String],
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        let state = self.tracked(table, tx)?;
        let mut pending: Vec<&String> = candidates
            .iter()
            .filter(|name| !state.catalog.records.iter().any(|(n, _)| n == *name))
            .collect();
        pending.sort();
        let rows = pending
            .into_iter()
            .map(|name| Record::new().with("pending_migration", Value::Text(name.clone())))
            .collect();
        Ok(NativeResult::from_rows(ENGINE, rows))
    }

    async fn most_recent_migration(
        &self,
        table: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        let state = self.tracked(table, tx)?;
        let rows = state
            .catalog
            .records
            .iter()
            .max_by_key(|(_, timestamp)| *timestamp)
            .map(|(name, timestamp)| {
                vec![Record::new()
                    .with("migration_name", Value::Text(name.clone()))
                    .with("migration_timestamp", Value::Int(*timestamp))]
            })
            .unwrap_or_default();
        Ok(NativeResult::from_rows(ENGINE, rows))
    }

    async fn insert_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        timestamp: i64,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        let mut state = self.tracked(table, tx)?;
        if state.catalog.records.iter().any(|(n, _)| n == migration_name) {
            return Err(RoutineError::statement(format!(
                "duplicate key value: {migration_name}"
            )));
        }
        state
            .catalog
            .records
            .push((migration_name.to_string(), timestamp));
        Ok(NativeResult::affected(ENGINE, 1))
    }

    async fn delete_migration_record(
        &self,
        table: &str,
        migration_name: &str,
        tx: Option<&Transaction>,
    ) -> Result<NativeResult> {
        let mut state = self.tracked(table, tx)?;
        let before = state.catalog.records.len();
        state.catalog.records.retain(|(n, _)| n != migration_name);
        let removed = before - state.catalog.records.len();
        Ok(NativeResult::affected(ENGINE, removed as u64))
    }

    async fn begin_transaction(&self) -> Result<Transaction> {
        let mut state = self.open()?;
        if state.snapshot.is_some() {
            return Err(RoutineError::statement("transaction already in progress"));
        }
        state.snapshot = Some(state.catalog.clone());
        Ok(Transaction::new(
            ENGINE,
            self.next_tx.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        check_transaction(ENGINE, Some(&tx))?;
        let mut state = self.open()?;
        state
            .snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| RoutineError::statement("no transaction in progress"))
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        check_transaction(ENGINE, Some(&tx))?;
        let mut state = self.open()?;
        let snapshot = state
            .snapshot
            .take()
            .ok_or_else(|| RoutineError::statement("no transaction in progress"))?;
        state.catalog = snapshot;
        Ok(())
    }

    async fn run_statements(&self, sql: &str, tx: Option<&Transaction>) -> Result<NativeResult> {
        self.execute(sql, tx)
    }

    fn escape_identifier(&self, name: &str) -> Result<String> {
        postgres_escape(name)
    }

    async fn preload_utilities(&self) -> Result<()> {
        self.open()?.utilities_loaded = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

/// Records started images and stop calls instead of running containers.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    failing: bool,
    started: Mutex<Vec<String>>,
    stopped: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A runtime whose `start` always fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn started_images(&self) -> Vec<String> {
        self.started.lock().expect("started lock").clone()
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        if self.failing {
            return Err(RoutineError::SandboxProvision(format!(
                "cannot pull {}",
                spec.image
            )));
        }
        let mut started = self.started.lock().expect("started lock");
        started.push(spec.image.clone());
        Ok(ContainerHandle {
            id: format!("fake-{}", started.len()),
        })
    }

    async fn host_port(&self, _container: &ContainerHandle, _container_port: u16) -> Result<u16> {
        Ok(49_153)
    }

    async fn stop(&self, _container: &ContainerHandle) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same adapter on every successful connect.
#[derive(Debug)]
pub struct StaticProvider {
    adapter: Arc<MemoryAdapter>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl StaticProvider {
    pub fn new(adapter: Arc<MemoryAdapter>) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Refuses the first `n` connection attempts.
    pub fn failing_first(self: Arc<Self>, n: usize) -> Arc<Self> {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProvider for StaticProvider {
    async fn connect(
        &self,
        engine: Engine,
        _params: &ConnectionParams,
    ) -> Result<Arc<dyn EngineAdapter>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RoutineError::statement(format!(
                "{engine}: connection refused"
            )));
        }
        let adapter: Arc<dyn EngineAdapter> = self.adapter.clone();
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_adapter_transactions() {
        let db = MemoryAdapter::new();
        db.create_tracking_table("other_migrations").await.unwrap();
        let tx = db.begin_transaction().await.unwrap();
        db.run_statements("CREATE TABLE x (id int);", Some(&tx))
            .await
            .unwrap();
        db.insert_migration_record("other_migrations", "1_x.sql", 1, Some(&tx))
            .await
            .unwrap();
        db.rollback(tx).await.unwrap();
        assert!(!db.has_table("x"));
        assert!(db.records().is_empty());
    }

    #[test]
    fn test_split_statements() {
        let script = "CREATE TABLE a (id int);\nCREATE FUNCTION f() RETURNS trigger AS $$\nBEGIN\n    RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql;\nDROP TABLE a;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3);
        assert!(statements[1].contains("RETURN NEW"));
    }
}
