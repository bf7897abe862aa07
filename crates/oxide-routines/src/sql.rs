//! Text helpers for routine definitions.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static TRIGGER_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bTRIGGER\b").expect("valid trigger regex"));

static OWNER_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bON\s+([A-Za-z0-9_`"\[\]]+(?:\.[A-Za-z0-9_`"\[\]]+)?)"#)
        .expect("valid owner table regex")
});

static TRIGGER_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bEXECUTE\s+(?:FUNCTION|PROCEDURE)\s+([A-Za-z0-9_."]+)"#)
        .expect("valid trigger function regex")
});

static TRIGGER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\bCREATE\s+(?:OR\s+(?:REPLACE|ALTER)\s+)?(?:DEFINER\s*=\s*\S+\s+)?(?:CONSTRAINT\s+)?TRIGGER\s+(?:IF\s+NOT\s+EXISTS\s+)?([A-Za-z0-9_`"\[\].]+)"#,
    )
    .expect("valid trigger name regex")
});

/// Last part of a possibly schema-qualified identifier.
///
/// Quoted parts keep their case; unquoted parts are folded to lower case the
/// way the engines resolve them (`ON Users` names the table `users`).
fn bare_identifier(raw: &str) -> String {
    let last = raw.rsplit('.').next().unwrap_or_default();
    let quoted = last.starts_with(['`', '"', '[']);
    let unquoted: String = last
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '[' | ']'))
        .collect();
    if quoted {
        unquoted
    } else {
        unquoted.to_ascii_lowercase()
    }
}

/// Table named by the `ON <table>` clause of a trigger definition.
///
/// Quoting and schema qualification are removed; unquoted names are
/// lower-cased.
#[must_use]
pub fn extract_owner_table(sql: &str) -> Option<String> {
    let start = TRIGGER_KEYWORD.find(sql).map_or(0, |m| m.end());
    OWNER_TABLE
        .captures(&sql[start..])
        .map(|caps| bare_identifier(&caps[1]))
        .filter(|name| !name.is_empty())
}

/// Function a PostgreSQL trigger calls (`EXECUTE FUNCTION name(...)`).
#[must_use]
pub fn extract_function_name(sql: &str) -> Option<String> {
    TRIGGER_FUNCTION
        .captures(sql)
        .map(|caps| bare_identifier(&caps[1]))
        .filter(|name| !name.is_empty())
}

/// Name declared by `CREATE ... TRIGGER <name>`.
#[must_use]
pub fn extract_trigger_name(sql: &str) -> Option<String> {
    TRIGGER_NAME
        .captures(sql)
        .map(|caps| bare_identifier(&caps[1]))
        .filter(|name| !name.is_empty())
}

/// Trigger name for a candidate file.
///
/// Exported triggers are written as `{trigger}_{table}.sql`; when the stem
/// carries the owner table suffix and the definition declares the shorter
/// name, the shorter name wins. Otherwise the stem is the name.
#[must_use]
pub fn resolve_trigger_name(stem: &str, owner_table: &str, sql: &str) -> String {
    let suffix = format!("_{owner_table}");
    if let Some(short) = stem.strip_suffix(&suffix) {
        if !short.is_empty() && extract_trigger_name(sql).as_deref() == Some(short) {
            return short.to_string();
        }
    }
    stem.to_string()
}

/// Terminator to append so `sql` ends with a statement separator.
///
/// Empty text and text already ending with `;` or a `GO` batch separator
/// need none.
#[must_use]
pub fn terminator(sql: &str) -> &'static str {
    let trimmed = sql.trim_end();
    let last_line = trimmed.lines().last().unwrap_or_default().trim();
    if trimmed.is_empty() || trimmed.ends_with(';') || last_line.eq_ignore_ascii_case("go") {
        ""
    } else {
        ";"
    }
}

/// `sql` with its [`terminator`] appended.
#[must_use]
pub fn with_terminator(sql: &str) -> String {
    format!("{sql}{}", terminator(sql))
}

/// Joins non-empty parts with newlines.
#[must_use]
pub fn join_statements<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Canonical form used for change detection: line endings unified,
/// trailing whitespace removed, surrounding blank space trimmed.
#[must_use]
pub fn normalize_for_compare(sql: &str) -> String {
    sql.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Hex SHA-256 of the normalized text.
#[must_use]
pub fn content_hash(sql: &str) -> String {
    let digest = Sha256::digest(normalize_for_compare(sql).as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
