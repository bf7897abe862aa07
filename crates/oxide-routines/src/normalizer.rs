//! Result normalizers.
//!
//! Turn the engine-native [`NativeResult`] shapes into engine-agnostic rows,
//! counts and [`StatementObject`]s, and strip engine noise (MySQL
//! `DEFINER=` clauses, SQL Server batch separators) from definitions.

use std::sync::LazyLock;

use regex::Regex;

use crate::adapter::{NativeResult, Record};
use crate::config::Engine;
use crate::object::{StatementKey, StatementObject};

static DEFINER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CREATE\s+DEFINER=`[^`]+`@`[^`]+`\s*").expect("valid definer regex")
});

/// Engine-specific view over native results.
pub trait ResultNormalizer: Send + Sync {
    /// Engine this normalizer reads results for.
    fn engine(&self) -> Engine;

    /// Rows of the primary result set.
    fn rows<'a>(&self, result: &'a NativeResult) -> &'a [Record];

    /// Number of affected rows.
    fn affected_count(&self, result: &NativeResult) -> u64;

    /// Removes engine noise from a definition. `prefer_replace` asks for a
    /// re-runnable `CREATE OR REPLACE` (`CREATE OR ALTER`) form where the
    /// engine's dialect has one.
    fn clean_definer(&self, sql: &str, prefer_replace: bool) -> String;

    /// Column that holds the source for `key`.
    fn source_column(&self, key: StatementKey) -> &'static str {
        key.as_str()
    }

    /// First row of the primary result set.
    fn first_row<'a>(&self, result: &'a NativeResult) -> Option<&'a Record> {
        self.rows(result).first()
    }

    /// Extracts the cleaned source for `key`; empty when the object is absent.
    fn statement_object(&self, result: &NativeResult, key: StatementKey) -> StatementObject {
        let source = self
            .first_row(result)
            .and_then(|row| row.text(self.source_column(key)))
            .filter(|source| !source.trim().is_empty());
        match source {
            Some(source) => StatementObject::new(key, self.clean_definer(source, false)),
            None => StatementObject::empty(key),
        }
    }
}

/// Normalizer for MySQL results.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlNormalizer;

/// Normalizer for PostgreSQL results.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresNormalizer;

/// Normalizer for SQL Server results.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsSqlNormalizer;

/// Returns the normalizer paired with `engine`.
#[must_use]
pub fn for_engine(engine: Engine) -> &'static dyn ResultNormalizer {
    match engine {
        Engine::MySql => &MySqlNormalizer,
        Engine::Postgres => &PostgresNormalizer,
        Engine::MsSql => &MsSqlNormalizer,
    }
}

impl ResultNormalizer for MySqlNormalizer {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    fn rows<'a>(&self, result: &'a NativeResult) -> &'a [Record] {
        match result {
            NativeResult::MySql { rows, .. } => rows,
            _ => &[],
        }
    }

    fn affected_count(&self, result: &NativeResult) -> u64 {
        match result {
            NativeResult::MySql { affected_rows, .. } => *affected_rows,
            _ => 0,
        }
    }

    fn clean_definer(&self, sql: &str, prefer_replace: bool) -> String {
        let sql = sql.trim();
        let create = if prefer_replace {
            "CREATE OR REPLACE "
        } else {
            "CREATE "
        };
        DEFINER.replace(sql, create).into_owned()
    }

    fn source_column(&self, key: StatementKey) -> &'static str {
        match key {
            StatementKey::Trigsrc => "SQL Original Statement",
            StatementKey::Prosrc => "Create Procedure",
            StatementKey::Funsrc => "Create Function",
            StatementKey::Tabledef => "Create Table",
        }
    }
}

impl ResultNormalizer for PostgresNormalizer {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn rows<'a>(&self, result: &'a NativeResult) -> &'a [Record] {
        match result {
            NativeResult::Postgres { rows, .. } => rows,
            _ => &[],
        }
    }

    fn affected_count(&self, result: &NativeResult) -> u64 {
        match result {
            NativeResult::Postgres { row_count, .. } => *row_count,
            _ => 0,
        }
    }

    // `pg_get_functiondef` already emits `CREATE OR REPLACE`; trigger
    // definitions stay plain for servers older than 14.
    fn clean_definer(&self, sql: &str, _prefer_replace: bool) -> String {
        sql.trim().to_string()
    }
}

impl ResultNormalizer for MsSqlNormalizer {
    fn engine(&self) -> Engine {
        Engine::MsSql
    }

    fn rows<'a>(&self, result: &'a NativeResult) -> &'a [Record] {
        match result {
            NativeResult::MsSql { recordsets, .. } => recordsets
                .iter()
                .find(|set| !set.is_empty())
                .map_or(&[][..], Vec::as_slice),
            _ => &[],
        }
    }

    fn affected_count(&self, result: &NativeResult) -> u64 {
        match result {
            NativeResult::MsSql { rows_affected, .. } => rows_affected.iter().sum(),
            _ => 0,
        }
    }

    fn clean_definer(&self, sql: &str, prefer_replace: bool) -> String {
        let mut sql = sql.trim();
        if let Some((body, last)) = sql.rsplit_once('\n') {
            if last.trim().trim_end_matches(';').eq_ignore_ascii_case("go") {
                sql = body.trim_end();
            }
        }
        if sql.is_empty() {
            return String::new();
        }
        let sql = if prefer_replace {
            or_alter(sql)
        } else {
            sql.to_string()
        };
        format!("{sql}\nGO")
    }
}

/// Rewrites a leading `CREATE` into `CREATE OR ALTER`.
fn or_alter(sql: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    if upper.starts_with("CREATE ") && !upper.starts_with("CREATE OR ") {
        format!("CREATE OR ALTER {}", sql["CREATE ".len()..].trim_start())
    } else {
        sql.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Value;

    fn text_row(column: &str, value: &str) -> Record {
        Record::new().with(column, Value::Text(value.to_string()))
    }

    #[test]
    fn test_mysql_definer_removed() {
        let sql = "CREATE DEFINER=`root`@`%` PROCEDURE `p`()\nBEGIN\n  SELECT 1;\nEND";
        assert_eq!(
            MySqlNormalizer.clean_definer(sql, false),
            "CREATE PROCEDURE `p`()\nBEGIN\n  SELECT 1;\nEND"
        );
    }

    #[test]
    fn test_mysql_prefer_replace() {
        let sql = "CREATE DEFINER=`root`@`%` PROCEDURE `p`() SELECT 1";
        assert_eq!(
            MySqlNormalizer.clean_definer(sql, true),
            "CREATE OR REPLACE PROCEDURE `p`() SELECT 1"
        );
        assert_eq!(
            MySqlNormalizer.clean_definer("CREATE PROCEDURE `p`() SELECT 1", true),
            "CREATE PROCEDURE `p`() SELECT 1"
        );
    }

    #[test]
    fn test_mysql_clean_is_idempotent() {
        let sql = "CREATE DEFINER=`app`@`localhost` TRIGGER t BEFORE INSERT ON a FOR EACH ROW SET NEW.x = 1";
        let once = MySqlNormalizer.clean_definer(sql, false);
        assert_eq!(MySqlNormalizer.clean_definer(&once, false), once);
    }

    #[test]
    fn test_mysql_statement_object_reads_show_create_column() {
        let result = NativeResult::MySql {
            rows: vec![text_row(
                "Create Function",
                "CREATE DEFINER=`root`@`%` FUNCTION f() RETURNS INT RETURN 1",
            )],
            affected_rows: 0,
        };
        let obj = MySqlNormalizer.statement_object(&result, StatementKey::Funsrc);
        assert_eq!(obj.get(StatementKey::Funsrc), Some("CREATE FUNCTION f() RETURNS INT RETURN 1"));
    }

    #[test]
    fn test_missing_object_is_empty() {
        let result = NativeResult::empty(Engine::Postgres);
        assert!(PostgresNormalizer
            .statement_object(&result, StatementKey::Prosrc)
            .is_empty());

        let null_row = NativeResult::Postgres {
            rows: vec![Record::new().with("tabledef", Value::Null)],
            row_count: 1,
        };
        assert!(PostgresNormalizer
            .statement_object(&null_row, StatementKey::Tabledef)
            .is_empty());
    }

    #[test]
    fn test_postgres_rows_and_count() {
        let result = NativeResult::Postgres {
            rows: vec![text_row("pending_migration", "1_a.sql")],
            row_count: 1,
        };
        assert_eq!(PostgresNormalizer.rows(&result).len(), 1);
        assert_eq!(PostgresNormalizer.affected_count(&result), 1);
        assert_eq!(
            PostgresNormalizer
                .first_row(&result)
                .and_then(|r| r.text("pending_migration")),
            Some("1_a.sql")
        );
    }

    #[test]
    fn test_mssql_appends_single_batch_separator() {
        let cleaned = MsSqlNormalizer.clean_definer("CREATE PROCEDURE p AS SELECT 1\n", false);
        assert_eq!(cleaned, "CREATE PROCEDURE p AS SELECT 1\nGO");
        assert_eq!(MsSqlNormalizer.clean_definer(&cleaned, false), cleaned);
        assert_eq!(MsSqlNormalizer.clean_definer("  ", false), "");
    }

    #[test]
    fn test_mssql_prefer_replace() {
        assert_eq!(
            MsSqlNormalizer.clean_definer("CREATE FUNCTION f() RETURNS INT AS BEGIN RETURN 1; END", true),
            "CREATE OR ALTER FUNCTION f() RETURNS INT AS BEGIN RETURN 1; END\nGO"
        );
    }

    #[test]
    fn test_mssql_first_non_empty_recordset() {
        let result = NativeResult::MsSql {
            recordsets: vec![vec![], vec![text_row("tabledef", "CREATE TABLE [a] (\n    [id] int NOT NULL\n);")]],
            rows_affected: vec![0, 1, 2],
        };
        assert_eq!(MsSqlNormalizer.rows(&result).len(), 1);
        assert_eq!(MsSqlNormalizer.affected_count(&result), 3);
    }

    #[test]
    fn test_shape_mismatch_yields_no_rows() {
        let result = NativeResult::from_rows(Engine::MySql, vec![text_row("x", "y")]);
        assert!(PostgresNormalizer.rows(&result).is_empty());
        assert!(MsSqlNormalizer.rows(&result).is_empty());
    }

    #[test]
    fn test_for_engine_pairs() {
        for engine in [Engine::MySql, Engine::Postgres, Engine::MsSql] {
            assert_eq!(for_engine(engine).engine(), engine);
        }
    }
}
