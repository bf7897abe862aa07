//! Dumping live procedural objects to files.
//!
//! Objects land under the export folder in the same directory layout the
//! configuration names for definition files, so an export folder can serve
//! as the working tree for `generate`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::adapter::{EngineAdapter, NativeResult};
use crate::apply::finish;
use crate::config::Config;
use crate::error::{Result, RoutineError};
use crate::migration_file::write_file;
use crate::normalizer::ResultNormalizer;
use crate::object::{ObjectKind, ProceduralObject};
use crate::sql::{extract_owner_table, with_terminator};

/// Writes every procedure, function and trigger of the live database into
/// the configured kind-specific directories below a folder.
pub struct ExportService<'a> {
    config: &'a Config,
    live: Arc<dyn EngineAdapter>,
    normalizer: &'static dyn ResultNormalizer,
}

impl<'a> ExportService<'a> {
    /// Creates an export service.
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

    /// Exports into `folder` and returns the written paths, sorted.
    ///
    /// # Errors
    ///
    /// Fails when listing objects fails or a file cannot be written.
    pub async fn run(self, folder: &Path) -> Result<Vec<PathBuf>> {
        let outcome = self.export(folder).await;
        finish(self.live.as_ref(), outcome, "exporting objects").await
    }

    async fn export(&self, folder: &Path) -> Result<Vec<PathBuf>> {
        let (procedures, functions, triggers) = tokio::try_join!(
            self.live.list_procedures(),
            self.live.list_functions(),
            self.live.list_triggers(),
        )?;

        let mut objects = self.objects(ObjectKind::Procedure, &procedures)?;
        objects.extend(self.objects(ObjectKind::Function, &functions)?);
        objects.extend(self.objects(ObjectKind::Trigger, &triggers)?);
        info!(count = objects.len(), folder = %folder.display(), "Exporting objects");

        let mut written: Vec<PathBuf> = stream::iter(objects)
            .map(|object| self.write_object(folder, object))
            .buffer_unordered(self.config.concurrency.export)
            .try_collect()
            .await?;
        written.sort();
        Ok(written)
    }

    fn objects(&self, kind: ObjectKind, result: &NativeResult) -> Result<Vec<ProceduralObject>> {
        self.normalizer
            .rows(result)
            .iter()
            .filter_map(|row| {
                let name = row.text("name")?;
                let source = row.text("source").unwrap_or_default();
                Some((name, source, row.text("owner_table")))
            })
            .map(|(name, source, owner_table)| match kind {
                ObjectKind::Procedure => Ok(ProceduralObject::procedure(name, source)),
                ObjectKind::Function => Ok(ProceduralObject::function(name, source)),
                ObjectKind::Trigger => {
                    let table = owner_table
                        .map(str::to_string)
                        .or_else(|| extract_owner_table(source))
                        .ok_or_else(|| RoutineError::MissingOwnerTable {
                            trigger: name.to_string(),
                        })?;
                    Ok(ProceduralObject::trigger(name, table, source))
                }
            })
            .collect()
    }

    async fn write_object(&self, folder: &Path, object: ProceduralObject) -> Result<PathBuf> {
        let file = object.owner_table.as_ref().map_or_else(
            || format!("{}.sql", object.name),
            |table| format!("{}_{table}.sql", object.name),
        );
        let source = self
            .normalizer
            .clean_definer(&object.source, self.config.prefer_replace);
        debug!(kind = %object.kind, name = %object.name, file = %file, "Writing object");
        write_file(
            &folder.join(nested(self.config.source_directory(object.kind))),
            &file,
            &with_terminator(&source),
        )
        .await
    }
}

/// `dir` reduced to its plain components so it always nests under the
/// export folder (`/srv/db/triggers` and `triggers` both stay inside).
fn nested(dir: &Path) -> PathBuf {
    dir.components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}
