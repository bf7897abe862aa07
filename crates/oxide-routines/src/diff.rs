//! Migration generation.
//!
//! Every candidate file is created inside the sandbox so the engine produces
//! its own canonical definition, which is then compared with what the live
//! catalog reports for the same object. Objects whose canonical forms differ
//! are staged into one migration file: the sandbox form (with the idempotent
//! drop prefix) as the forward section, the live form as the reverse section.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapter::{validate_identifier, EngineAdapter};
use crate::config::Config;
use crate::error::{Result, RoutineError};
use crate::migration_file::{file_name, file_stem, list_sql_files, write_file, MigrationBuffer};
use crate::normalizer::ResultNormalizer;
use crate::object::{ObjectKind, StatementKey};
use crate::sandbox::Sandbox;
use crate::sql::{
    content_hash, extract_function_name, extract_owner_table, join_statements,
    resolve_trigger_name,
};

/// One object whose definition changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChange {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object name.
    pub name: String,
    /// Owning table (triggers only).
    pub owner_table: Option<String>,
    /// Forward SQL: drop prefix plus the sandbox definition.
    pub up: String,
    /// Reverse SQL: drop prefix plus the live definition.
    pub down: String,
}

#[derive(Debug)]
struct Candidate {
    kind: ObjectKind,
    path: PathBuf,
}

/// Generates migrations by diffing candidate files against the live
/// database.
pub struct DiffEngine<'a> {
    config: &'a Config,
    live: Arc<dyn EngineAdapter>,
    normalizer: &'static dyn ResultNormalizer,
    sandbox: Sandbox,
    seeded_tables: Mutex<HashSet<String>>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine. The sandbox must be uninitialized.
    #[must_use]
    pub fn new(
        config: &'a Config,
        live: Arc<dyn EngineAdapter>,
        normalizer: &'static dyn ResultNormalizer,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            config,
            live,
            normalizer,
            sandbox,
            seeded_tables: Mutex::new(HashSet::new()),
        }
    }

    /// Writes `{timestamp}_{name}.sql` when at least one object changed.
    ///
    /// Returns the path of the written file, or `None` when nothing changed.
    /// The sandbox is torn down and the live connection closed on every
    /// path.
    ///
    /// # Errors
    ///
    /// Fails for an unsafe migration name, when the sandbox cannot be
    /// provisioned, or when a candidate is rejected by the sandbox engine.
    pub async fn generate(mut self, migration_name: &str) -> Result<Option<PathBuf>> {
        let timestamp = Utc::now().timestamp_millis();
        let outcome = async {
            validate_identifier(migration_name)?;
            self.stage_changes().await
        }
        .await;

        let sandbox_closed = self.sandbox.teardown().await;
        let live_closed = self.live.close().await;

        let staged = match outcome {
            Ok(staged) => staged,
            Err(e) => {
                error!(error = %e, "Error while generating migration");
                if let Err(close_err) = sandbox_closed {
                    warn!(error = %close_err, "Sandbox teardown failed");
                }
                if let Err(close_err) = live_closed {
                    warn!(error = %close_err, "Closing live connection failed");
                }
                return Err(e);
            }
        };
        sandbox_closed?;
        live_closed?;

        if staged.is_empty() {
            info!("No changes found, no migration generated");
            return Ok(None);
        }

        let mut buffer = MigrationBuffer::new();
        for change in &staged {
            buffer.push(&change.up, &change.down);
        }
        let path = write_file(
            &self.config.migrations_directory,
            &file_name(timestamp, migration_name),
            &buffer.render(),
        )
        .await?;
        info!(path = %path.display(), objects = buffer.len(), "Migration file created");
        Ok(Some(path))
    }

    /// Provisions the sandbox and diffs every candidate: routines first,
    /// then triggers, since triggers may reference functions.
    async fn stage_changes(&mut self) -> Result<Vec<StagedChange>> {
        self.live.preload_utilities().await?;
        self.sandbox
            .initialize(self.live.as_ref(), self.normalizer)
            .await?;
        self.sandbox.connect().await?;
        self.sandbox.preload_utilities().await?;
        let sandbox = self.sandbox.adapter()?;

        let this = &*self;
        let mut routines = candidates(ObjectKind::Procedure, this.config).await?;
        routines.extend(candidates(ObjectKind::Function, this.config).await?);
        let triggers = candidates(ObjectKind::Trigger, this.config).await?;
        let limit = this.config.concurrency.diff;

        let mut staged: Vec<StagedChange> = stream::iter(routines)
            .map(|candidate| this.diff_routine(candidate, sandbox.as_ref()))
            .buffer_unordered(limit)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        let trigger_changes: Vec<Option<StagedChange>> = stream::iter(triggers)
            .map(|candidate| this.diff_trigger(candidate, sandbox.as_ref()))
            .buffer_unordered(limit)
            .try_collect()
            .await?;
        staged.extend(trigger_changes.into_iter().flatten());

        staged.sort_by(|a, b| {
            (a.kind, &a.name, &a.owner_table).cmp(&(b.kind, &b.name, &b.owner_table))
        });
        Ok(staged)
    }

    async fn diff_routine(
        &self,
        candidate: Candidate,
        sandbox: &dyn EngineAdapter,
    ) -> Result<Option<StagedChange>> {
        let kind = candidate.kind;
        let name = file_stem(&candidate.path);
        self.live.escape_identifier(&name)?;
        let text = tokio::fs::read_to_string(&candidate.path).await?;
        info!("Found {kind} {name}, checking for changes...");

        sandbox.run_statements(&text, None).await?;
        let (live_source, sandbox_source) = tokio::try_join!(
            self.source(self.live.as_ref(), kind, &name, None),
            self.source(sandbox, kind, &name, None),
        )?;
        if sandbox_source.is_empty() {
            return Err(RoutineError::ObjectNotCreated {
                kind: kind.to_string(),
                name,
            });
        }

        let existing = join_statements(&[
            &self
                .live
                .drop_statement(&name, kind, None, live_source.is_empty())?,
            &live_source,
        ]);
        let new = join_statements(&[
            &self.live.drop_statement(&name, kind, None, false)?,
            &sandbox_source,
        ]);
        Ok(stage(kind, name, None, existing, new))
    }

    async fn diff_trigger(
        &self,
        candidate: Candidate,
        sandbox: &dyn EngineAdapter,
    ) -> Result<Option<StagedChange>> {
        let stem = file_stem(&candidate.path);
        let text = tokio::fs::read_to_string(&candidate.path).await?;
        let table = extract_owner_table(&text)
            .ok_or_else(|| RoutineError::MissingOwnerTable {
                trigger: stem.clone(),
            })?;
        let name = resolve_trigger_name(&stem, &table, &text);
        self.live.escape_identifier(&name)?;
        self.live.escape_identifier(&table)?;
        info!("Found trigger {name} on {table}, checking for changes...");

        let kind = ObjectKind::Trigger;
        let live_source = self
            .source(self.live.as_ref(), kind, &name, Some(&table))
            .await?;
        let existing = join_statements(&[
            &self
                .live
                .drop_statement(&name, kind, Some(&table), live_source.is_empty())?,
            &live_source,
        ]);

        self.seed_table(sandbox, &table).await?;
        if let Some(function) = extract_function_name(&text) {
            let previous = extract_function_name(&live_source);
            if previous.as_deref().is_some_and(|p| p != function) {
                info!(
                    trigger = %name,
                    from = previous.as_deref().unwrap_or_default(),
                    to = %function,
                    "Trigger function changed"
                );
            }
            self.ensure_function(sandbox, &function).await?;
        }

        sandbox.run_statements(&text, None).await?;
        let sandbox_source = self.source(sandbox, kind, &name, Some(&table)).await?;
        if sandbox_source.is_empty() {
            return Err(RoutineError::ObjectNotCreated {
                kind: kind.to_string(),
                name,
            });
        }
        let new = join_statements(&[
            &self.live.drop_statement(&name, kind, Some(&table), false)?,
            &sandbox_source,
        ]);
        Ok(stage(kind, name, Some(table), existing, new))
    }

    /// Cleaned source of an object, empty when it does not exist.
    async fn source(
        &self,
        adapter: &dyn EngineAdapter,
        kind: ObjectKind,
        name: &str,
        owner_table: Option<&str>,
    ) -> Result<String> {
        let result = match kind {
            ObjectKind::Procedure => adapter.procedure_source(name).await?,
            ObjectKind::Function => adapter.function_source(name).await?,
            ObjectKind::Trigger => adapter.trigger_source(name, owner_table).await?,
        };
        Ok(self
            .normalizer
            .statement_object(&result, kind.statement_key())
            .into_source())
    }

    /// Mirrors a live table into the sandbox once, or a minimal stand-in
    /// when the live database has no such table.
    async fn seed_table(&self, sandbox: &dyn EngineAdapter, table: &str) -> Result<()> {
        let mut seeded = self.seeded_tables.lock().await;
        if seeded.contains(table) {
            return Ok(());
        }

        let ddl = self
            .normalizer
            .statement_object(&self.live.table_ddl(table).await?, StatementKey::Tabledef)
            .into_source();
        if ddl.is_empty() {
            debug!(table, "Table not found in live database, creating a placeholder");
            sandbox.create_temporary_table(table).await?;
        } else {
            debug!(table, "Copying table definition into sandbox");
            sandbox.run_statements(&ddl, None).await?;
        }
        seeded.insert(table.to_string());
        Ok(())
    }

    /// Creates a placeholder for a trigger function the sandbox lacks.
    async fn ensure_function(&self, sandbox: &dyn EngineAdapter, function: &str) -> Result<()> {
        let present = !self
            .source(sandbox, ObjectKind::Function, function, None)
            .await?
            .is_empty();
        if !present {
            debug!(function, "Creating placeholder function in sandbox");
            sandbox.create_placeholder_function(function).await?;
        }
        Ok(())
    }
}

async fn candidates(kind: ObjectKind, config: &Config) -> Result<Vec<Candidate>> {
    Ok(list_sql_files(config.source_directory(kind))
        .await?
        .into_iter()
        .map(|path| Candidate { kind, path })
        .collect())
}

fn stage(
    kind: ObjectKind,
    name: String,
    owner_table: Option<String>,
    existing: String,
    new: String,
) -> Option<StagedChange> {
    if content_hash(&existing) == content_hash(&new) {
        debug!(%kind, name = %name, "Unchanged");
        return None;
    }
    info!(%kind, name = %name, "Change detected");
    Some(StagedChange {
        kind,
        name,
        owner_table,
        up: new,
        down: existing,
    })
}
