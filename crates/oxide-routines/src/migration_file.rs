//! Migration file format.
//!
//! A migration is a single SQL file named `{timestamp}_{name}.sql`:
//!
//! ```text
//! -- UP
//! <forward statements>
//! -- DOWN
//! <reverse statements>
//! ```
//!
//! Sections are located line by line: any line containing a marker opens or
//! closes a section, and the marker line itself is not part of it. Text
//! before `-- UP` is ignored.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::sql::with_terminator;

/// Marker line opening the forward section.
pub const UP_MARKER: &str = "-- UP";

/// Marker line opening the reverse section.
pub const DOWN_MARKER: &str = "-- DOWN";

/// File name for a migration created at `timestamp` (epoch millis).
#[must_use]
pub fn file_name(timestamp: i64, name: &str) -> String {
    format!("{timestamp}_{name}.sql")
}

/// Accumulates forward and reverse SQL for one migration file.
#[derive(Debug, Default, Clone)]
pub struct MigrationBuffer {
    up: String,
    down: String,
    entries: usize,
}

impl MigrationBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one object's forward and reverse SQL.
    pub fn push(&mut self, up: &str, down: &str) {
        self.up.push('\n');
        self.up.push_str(&with_terminator(up));
        self.down.push('\n');
        self.down.push_str(&with_terminator(down));
        self.entries += 1;
    }

    /// Number of staged objects.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries
    }

    /// Returns whether nothing was staged.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// File content.
    #[must_use]
    pub fn render(&self) -> String {
        format!("{UP_MARKER}{}\n{DOWN_MARKER}{}\n", self.up, self.down)
    }
}

/// Text between the first line containing `start` and the next line
/// containing `end` (or end of file), trimmed.
#[must_use]
pub fn extract_section(content: &str, start: &str, end: Option<&str>) -> String {
    let mut capturing = false;
    let mut section = Vec::new();
    for line in content.lines() {
        if !capturing {
            capturing = line.contains(start);
            continue;
        }
        if end.is_some_and(|end| line.contains(end)) {
            break;
        }
        section.push(line);
    }
    section.join("\n").trim().to_string()
}

/// Forward section.
#[must_use]
pub fn up_section(content: &str) -> String {
    extract_section(content, UP_MARKER, Some(DOWN_MARKER))
}

/// Reverse section.
#[must_use]
pub fn down_section(content: &str) -> String {
    extract_section(content, DOWN_MARKER, None)
}

/// `.sql` files directly inside `dir`, sorted by file name.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Fails when `dir` exists but cannot be read.
pub async fn list_sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(directory = %dir.display(), "Directory not found, skipping");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_sql = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
        if is_sql && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    debug!(directory = %dir.display(), count = files.len(), "Listed SQL files");
    Ok(files)
}

/// File names of the migrations in `dir`, sorted.
///
/// # Errors
///
/// Fails when `dir` exists but cannot be read.
pub async fn list_migration_names(dir: &Path) -> Result<Vec<String>> {
    Ok(list_sql_files(dir)
        .await?
        .iter()
        .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
        .collect())
}

/// Stem of a candidate file (`audit_users.sql` -> `audit_users`).
#[must_use]
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Writes `content` to `dir/name`, creating `dir` if needed.
///
/// # Errors
///
/// Fails when the directory or the file cannot be written.
pub async fn write_file(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, content).await?;
    Ok(path)
}
