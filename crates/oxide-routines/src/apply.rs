//! Applying pending migrations.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::adapter::{EngineAdapter, Transaction};
use crate::config::Config;
use crate::error::{Result, RoutineError};
use crate::migration_file::{list_migration_names, up_section};
use crate::normalizer::ResultNormalizer;

/// Applied and pending migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Files with a tracking record, sorted.
    pub applied: Vec<String>,
    /// Files without a tracking record, sorted.
    pub pending: Vec<String>,
    /// Most recently applied migration, if any.
    pub latest: Option<String>,
}

/// Runs pending migrations inside one transaction.
pub struct ApplyEngine<'a> {
    config: &'a Config,
    live: Arc<dyn EngineAdapter>,
    normalizer: &'static dyn ResultNormalizer,
}

impl<'a> ApplyEngine<'a> {
    /// Creates an apply engine.
    #[must_use]
    pub const fn new(
        config: &'a Config,
        live: Arc<dyn EngineAdapter>,
        normalizer: &'static dyn ResultNormalizer,
    ) -> Self {
        Self {
            config,
            live,
            normalizer,
        }
    }

    fn table(&self) -> &str {
        &self.config.migrations_table
    }

    /// Creates the tracking table, then closes the connection.
    ///
    /// # Errors
    ///
    /// Fails when the tracking table cannot be created.
    pub async fn init(self) -> Result<()> {
        info!(table = %self.table(), "Creating tracking table if it does not exist");
        let outcome = self.live.create_tracking_table(self.table()).await;
        finish(self.live.as_ref(), outcome, "initializing tracking table").await
    }

    /// Applies every pending migration in ascending file-name order and
    /// returns their names. Either all are applied and recorded, or none.
    ///
    /// # Errors
    ///
    /// Fails when a migration file is malformed or a statement fails; the
    /// transaction is rolled back and nothing is recorded.
    pub async fn run(self) -> Result<Vec<String>> {
        let outcome = self.apply_pending().await;
        finish(self.live.as_ref(), outcome, "running migrations").await
    }

    /// Lists applied and pending migrations without changing anything.
    ///
    /// # Errors
    ///
    /// Fails when the migrations directory or the tracking table cannot be
    /// read.
    pub async fn status(self) -> Result<MigrationStatus> {
        let outcome = self.collect_status().await;
        finish(self.live.as_ref(), outcome, "reading migration status").await
    }

    async fn apply_pending(&self) -> Result<Vec<String>> {
        info!(table = %self.table(), "Creating tracking table if it does not exist");
        self.live.create_tracking_table(self.table()).await?;

        let files = list_migration_names(&self.config.migrations_directory).await?;
        let tx = self.live.begin_transaction().await?;
        match self.apply_in(&tx, &files).await {
            Ok(applied) => {
                self.live
                    .commit(tx)
                    .await
                    .map_err(|e| RoutineError::transaction("commit", e))?;
                Ok(applied)
            }
            Err(e) => {
                warn!(error = %e, "Migration failed, rolling back");
                self.live
                    .rollback(tx)
                    .await
                    .map_err(|rollback| RoutineError::transaction("rollback", rollback))?;
                Err(e)
            }
        }
    }

    async fn apply_in(&self, tx: &Transaction, files: &[String]) -> Result<Vec<String>> {
        let pending = self.pending(files, Some(tx)).await?;
        if pending.is_empty() {
            info!("No pending migrations found");
            return Ok(Vec::new());
        }

        let dir = &self.config.migrations_directory;
        let scripts: Vec<(String, String)> = stream::iter(pending)
            .map(|file| read_up_section(dir, file))
            .buffered(self.config.concurrency.apply)
            .try_collect()
            .await?;

        let base = self.next_timestamp(tx).await?;
        let mut applied = Vec::with_capacity(scripts.len());
        for ((file, sql), timestamp) in scripts.into_iter().zip(base..) {
            warn!(migration = %file, "Running migration");
            debug!(sql = %sql, "Executing SQL");
            self.live.run_statements(&sql, Some(tx)).await?;
            self.live
                .insert_migration_record(self.table(), &file, timestamp, Some(tx))
                .await?;
            info!(migration = %file, "Migration applied successfully");
            applied.push(file);
        }
        Ok(applied)
    }

    /// Pending file names in ascending order.
    async fn pending(&self, files: &[String], tx: Option<&Transaction>) -> Result<Vec<String>> {
        let result = self
            .live
            .pending_migrations(files, self.table(), tx)
            .await?;
        let mut pending: Vec<String> = self
            .normalizer
            .rows(&result)
            .iter()
            .filter_map(|row| row.text("pending_migration").map(str::to_string))
            .collect();
        pending.sort();
        Ok(pending)
    }

    /// First timestamp for this run: now, but never at or below an existing
    /// record, so records stay strictly increasing.
    async fn next_timestamp(&self, tx: &Transaction) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let latest = self
            .live
            .most_recent_migration(self.table(), Some(tx))
            .await?;
        let last = self
            .normalizer
            .first_row(&latest)
            .and_then(|row| row.int("migration_timestamp"));
        Ok(last.map_or(now, |last| now.max(last + 1)))
    }

    async fn collect_status(&self) -> Result<MigrationStatus> {
        self.live.create_tracking_table(self.table()).await?;
        let files = list_migration_names(&self.config.migrations_directory).await?;
        let pending = self.pending(&files, None).await?;
        let applied = files
            .into_iter()
            .filter(|file| pending.binary_search(file).is_err())
            .collect();
        let latest = self
            .live
            .most_recent_migration(self.table(), None)
            .await?;
        let latest = self
            .normalizer
            .first_row(&latest)
            .and_then(|row| row.text("migration_name"))
            .map(str::to_string);
        Ok(MigrationStatus {
            applied,
            pending,
            latest,
        })
    }
}

async fn read_up_section(dir: &Path, file: String) -> Result<(String, String)> {
    let content = tokio::fs::read_to_string(dir.join(&file)).await?;
    Ok((file, up_section(&content)))
}

/// Closes the live connection after an operation, logging the operation's
/// failure and returning it in preference to a close failure.
pub(crate) async fn finish<T>(
    live: &dyn EngineAdapter,
    outcome: Result<T>,
    action: &str,
) -> Result<T> {
    let closed = live.close().await;
    match outcome {
        Ok(value) => closed.map(|()| value),
        Err(e) => {
            error!(error = %e, "Error while {action}");
            if let Err(close_err) = closed {
                warn!(error = %close_err, "Closing live connection failed");
            }
            Err(e)
        }
    }
}
