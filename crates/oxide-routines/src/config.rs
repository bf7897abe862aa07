//! Configuration for a single command invocation.
//!
//! Configuration is read once from a TOML file and passed explicitly to every
//! service; nothing here is global.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Result, RoutineError};
use crate::object::ObjectKind;

/// Default tracking table name.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "other_migrations";

/// Environment variable consulted when the config file omits the password.
pub const PASSWORD_ENV: &str = "OXIDE_ROUTINES_PASSWORD";

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// MySQL-family.
    MySql,
    /// PostgreSQL-family.
    Postgres,
    /// SQL-Server-family.
    MsSql,
}

impl Engine {
    /// Configuration name of the engine.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::MsSql => "mssql",
        }
    }

    /// Port the engine listens on by default.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
            Self::MsSql => 1433,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Engine {
    type Err = RoutineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mssql" | "sqlserver" => Ok(Self::MsSql),
            other => Err(RoutineError::UnsupportedEngine(other.to_string())),
        }
    }
}

/// Engine-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database (schema) name.
    pub database: String,
    /// Accept self-signed server certificates (SQL Server).
    pub trust_server_certificate: bool,
}

/// Bounded pool sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    /// Concurrent objects during `generate`.
    pub diff: usize,
    /// Concurrent objects during `export`.
    pub export: usize,
    /// Concurrent file reads during `up`.
    pub apply: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            diff: 5,
            export: 9,
            apply: 5,
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Selected engine.
    pub engine: Engine,
    /// Directory holding generated migration files.
    pub migrations_directory: PathBuf,
    /// Directory holding procedure sources.
    pub procedures_directory: PathBuf,
    /// Directory holding function sources.
    pub functions_directory: PathBuf,
    /// Directory holding trigger sources.
    pub triggers_directory: PathBuf,
    /// Tracking table name.
    pub migrations_table: String,
    /// Export definitions as `CREATE OR REPLACE` (`CREATE OR ALTER` on SQL
    /// Server) where the engine allows it.
    pub prefer_replace: bool,
    /// Live database connection parameters.
    pub connection: ConnectionParams,
    /// Pool sizes.
    pub concurrency: Concurrency,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    engine: String,
    migrations_directory: Option<PathBuf>,
    procedures_directory: Option<PathBuf>,
    functions_directory: Option<PathBuf>,
    triggers_directory: Option<PathBuf>,
    migrations_table: Option<String>,
    #[serde(default)]
    prefer_replace: bool,
    connection: RawConnection,
    #[serde(default)]
    concurrency: Concurrency,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    #[serde(default = "default_host")]
    host: String,
    port: Option<u16>,
    user: String,
    password: Option<String>,
    database: String,
    #[serde(default)]
    trust_server_certificate: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is not a valid configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RoutineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content, std::env::var(PASSWORD_ENV).ok())
    }

    /// Parses configuration text, falling back to `env_password` when the
    /// file has no password.
    ///
    /// # Errors
    ///
    /// Returns [`RoutineError::Config`] for malformed TOML, unknown engines or
    /// missing connection settings.
    pub fn from_toml(content: &str, env_password: Option<String>) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let engine: Engine = raw.engine.parse()?;

        let password = raw
            .connection
            .password
            .or(env_password)
            .ok_or_else(|| {
                RoutineError::Config(format!(
                    "connection.password is not set and {PASSWORD_ENV} is empty"
                ))
            })?;

        let concurrency = raw.concurrency;
        if concurrency.diff == 0 || concurrency.export == 0 || concurrency.apply == 0 {
            return Err(RoutineError::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            engine,
            migrations_directory: raw
                .migrations_directory
                .unwrap_or_else(|| PathBuf::from("migrations")),
            procedures_directory: raw
                .procedures_directory
                .unwrap_or_else(|| PathBuf::from("procedures")),
            functions_directory: raw
                .functions_directory
                .unwrap_or_else(|| PathBuf::from("functions")),
            triggers_directory: raw
                .triggers_directory
                .unwrap_or_else(|| PathBuf::from("triggers")),
            migrations_table: raw
                .migrations_table
                .unwrap_or_else(|| DEFAULT_MIGRATIONS_TABLE.to_string()),
            prefer_replace: raw.prefer_replace,
            connection: ConnectionParams {
                host: raw.connection.host,
                port: raw.connection.port.unwrap_or(engine.default_port()),
                user: raw.connection.user,
                password,
                database: raw.connection.database,
                trust_server_certificate: raw.connection.trust_server_certificate,
            },
            concurrency,
        })
    }

    /// Directory holding the definition files of `kind`.
    #[must_use]
    pub fn source_directory(&self, kind: ObjectKind) -> &Path {
        match kind {
            ObjectKind::Procedure => &self.procedures_directory,
            ObjectKind::Function => &self.functions_directory,
            ObjectKind::Trigger => &self.triggers_directory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
engine = "postgres"

[connection]
user = "postgres"
password = "secret"
database = "app"
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml(MINIMAL, None).unwrap();
        assert_eq!(config.engine, Engine::Postgres);
        assert_eq!(config.migrations_directory, PathBuf::from("migrations"));
        assert_eq!(config.procedures_directory, PathBuf::from("procedures"));
        assert_eq!(config.functions_directory, PathBuf::from("functions"));
        assert_eq!(config.triggers_directory, PathBuf::from("triggers"));
        assert_eq!(config.migrations_table, "other_migrations");
        assert!(!config.prefer_replace);
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 5432);
        assert_eq!(config.concurrency, Concurrency::default());
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let content = MINIMAL.replace("postgres\"", "oracle\"");
        let err = Config::from_toml(&content, None).unwrap_err();
        assert!(matches!(err, RoutineError::UnsupportedEngine(e) if e == "oracle"));
    }

    #[test]
    fn test_password_from_environment() {
        let content = MINIMAL.replace("password = \"secret\"\n", "");
        let config = Config::from_toml(&content, Some("from-env".to_string())).unwrap();
        assert_eq!(config.connection.password, "from-env");

        let err = Config::from_toml(&content, None).unwrap_err();
        assert!(matches!(err, RoutineError::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let content = r#"
engine = "mssql"
migrations_directory = "db/migrations"
migrations_table = "routine_history"
triggers_directory = "db/triggers"
prefer_replace = true

[connection]
host = "db.internal"
user = "sa"
password = "pw"
database = "master"
trust_server_certificate = true

[concurrency]
diff = 2
"#;
        let config = Config::from_toml(content, None).unwrap();
        assert_eq!(config.engine, Engine::MsSql);
        assert_eq!(config.connection.port, 1433);
        assert!(config.connection.trust_server_certificate);
        assert_eq!(config.migrations_table, "routine_history");
        assert!(config.prefer_replace);
        assert_eq!(
            config.source_directory(ObjectKind::Trigger),
            Path::new("db/triggers")
        );
        assert_eq!(
            config.source_directory(ObjectKind::Procedure),
            Path::new("procedures")
        );
        assert_eq!(config.concurrency.diff, 2);
        assert_eq!(config.concurrency.export, 9);
    }

    #[test]
    fn test_engine_aliases() {
        assert_eq!("MySQL".parse::<Engine>().unwrap(), Engine::MySql);
        assert_eq!("postgresql".parse::<Engine>().unwrap(), Engine::Postgres);
        assert_eq!("sqlserver".parse::<Engine>().unwrap(), Engine::MsSql);
        assert!("sqlite".parse::<Engine>().is_err());
    }
}
