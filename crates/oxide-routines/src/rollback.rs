//! Reverting the most recent migration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapter::{EngineAdapter, Transaction};
use crate::apply::finish;
use crate::config::Config;
use crate::error::{Result, RoutineError};
use crate::migration_file::down_section;
use crate::normalizer::ResultNormalizer;

/// Reverts exactly one migration: the record with the highest timestamp.
pub struct RollbackEngine<'a> {
    config: &'a Config,
    live: Arc<dyn EngineAdapter>,
    normalizer: &'static dyn ResultNormalizer,
}

impl<'a> RollbackEngine<'a> {
    /// Creates a rollback engine.
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

    /// Runs the reverse section of the latest migration and deletes its
    /// record. Returns the reverted file name, or `None` when nothing has
    /// been applied.
    ///
    /// # Errors
    ///
    /// Fails when the applied file is missing or its reverse section fails;
    /// the record is kept in that case.
    pub async fn run(self) -> Result<Option<String>> {
        let outcome = self.revert_latest().await;
        finish(self.live.as_ref(), outcome, "reverting migration").await
    }

    async fn revert_latest(&self) -> Result<Option<String>> {
        let table = &self.config.migrations_table;
        self.live.create_tracking_table(table).await?;

        let tx = self.live.begin_transaction().await?;
        match self.revert_in(&tx).await {
            Ok(reverted) => {
                self.live
                    .commit(tx)
                    .await
                    .map_err(|e| RoutineError::transaction("commit", e))?;
                Ok(reverted)
            }
            Err(e) => {
                warn!(error = %e, "Revert failed, rolling back");
                self.live
                    .rollback(tx)
                    .await
                    .map_err(|rollback| RoutineError::transaction("rollback", rollback))?;
                Err(e)
            }
        }
    }

    async fn revert_in(&self, tx: &Transaction) -> Result<Option<String>> {
        let table = &self.config.migrations_table;
        let latest = self.live.most_recent_migration(table, Some(tx)).await?;
        let Some(name) = self
            .normalizer
            .first_row(&latest)
            .and_then(|row| row.text("migration_name"))
            .map(str::to_string)
        else {
            info!("No applied migrations found, nothing to revert");
            return Ok(None);
        };

        let path: PathBuf = self.config.migrations_directory.join(&name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RoutineError::MigrationFileMissing(path));
            }
            Err(e) => return Err(e.into()),
        };

        let sql = down_section(&content);
        warn!(migration = %name, "Reverting migration");
        debug!(sql = %sql, "Executing rollback SQL");
        self.live.run_statements(&sql, Some(tx)).await?;
        self.live
            .delete_migration_record(table, &name, Some(tx))
            .await?;
        info!(migration = %name, "Migration reverted successfully");
        Ok(Some(name))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::normalizer::PostgresNormalizer;
    use crate::testing::{test_config, MemoryAdapter};

    fn migration(dir: &Path, name: &str, up: &str, down: &str) {
        let migrations = dir.join("migrations");
        std::fs::create_dir_all(&migrations).unwrap();
        std::fs::write(
            migrations.join(name),
            format!("-- UP\n{up}\n-- DOWN\n{down}\n"),
        )
        .unwrap();
    }

    async fn applied_three(dir: &Path) -> Arc<MemoryAdapter> {
        let live = MemoryAdapter::new();
        for (name, ts) in [("10_a.sql", 10), ("20_b.sql", 20), ("30_c.sql", 30)] {
            let table = format!("x_{}", &name[3..4]);
            migration(
                dir,
                name,
                &format!("CREATE TABLE {table} (id int);"),
                &format!("DROP TABLE {table};"),
            );
            live.seed(&format!("CREATE TABLE {table} (id int);"));
            live.seed_record(name, ts);
        }
        live
    }

    #[tokio::test]
    async fn test_reverts_only_latest() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let live = applied_three(dir.path()).await;

        let reverted = RollbackEngine::new(&config, live.clone(), &PostgresNormalizer)
            .run()
            .await
            .unwrap();
        assert_eq!(reverted.as_deref(), Some("30_c.sql"));

        let names: Vec<String> = live.records().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["10_a.sql", "20_b.sql"]);
        assert!(live.has_table("x_a"));
        assert!(live.has_table("x_b"));
        assert!(!live.has_table("x_c"));
        assert_eq!(live.executed(), vec!["DROP TABLE x_c;"]);
        assert!(live.is_closed());
    }

    #[tokio::test]
    async fn test_nothing_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let live = MemoryAdapter::new();

        let reverted = RollbackEngine::new(&config, live.clone(), &PostgresNormalizer)
            .run()
            .await
            .unwrap();
        assert_eq!(reverted, None);
        assert!(live.executed().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let live = applied_three(dir.path()).await;
        std::fs::remove_file(dir.path().join("migrations").join("30_c.sql")).unwrap();

        let err = RollbackEngine::new(&config, live.clone(), &PostgresNormalizer)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, RoutineError::MigrationFileMissing(path) if path.ends_with("30_c.sql")));
        assert_eq!(live.records().len(), 3);
        assert!(live.has_table("x_c"));
    }

    #[tokio::test]
    async fn test_failed_down_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let live = applied_three(dir.path()).await;
        live.fail_on("x_c");

        let err = RollbackEngine::new(&config, live.clone(), &PostgresNormalizer)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, RoutineError::Execution(_)));
        assert_eq!(live.records().len(), 3);
    }
}
