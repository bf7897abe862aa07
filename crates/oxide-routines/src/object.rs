//! Procedural object model.
//!
//! Procedures, functions and triggers are identified by `(kind, name)`, with
//! triggers additionally scoped by the table they are attached to: PostgreSQL
//! allows the same trigger name on different tables.

use std::fmt;

/// The kind of engine-persisted routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Stored procedure.
    Procedure,
    /// Stored function.
    Function,
    /// Trigger bound to a table.
    Trigger,
}

impl ObjectKind {
    /// Keyword used in `CREATE`/`DROP` statements.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Procedure => "PROCEDURE",
            Self::Function => "FUNCTION",
            Self::Trigger => "TRIGGER",
        }
    }

    /// The statement key a normalizer extracts for this kind.
    #[must_use]
    pub const fn statement_key(self) -> StatementKey {
        match self {
            Self::Procedure => StatementKey::Prosrc,
            Self::Function => StatementKey::Funsrc,
            Self::Trigger => StatementKey::Trigsrc,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Procedure => "procedure",
            Self::Function => "function",
            Self::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

/// Fixed set of keys a [`StatementObject`] can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKey {
    /// Trigger source.
    Trigsrc,
    /// Procedure source.
    Prosrc,
    /// Function source.
    Funsrc,
    /// Table definition.
    Tabledef,
}

impl StatementKey {
    /// Column alias used by the catalog queries that expose this key directly.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trigsrc => "trigsrc",
            Self::Prosrc => "prosrc",
            Self::Funsrc => "funsrc",
            Self::Tabledef => "tabledef",
        }
    }
}

/// Source text extracted for exactly one [`StatementKey`].
///
/// An empty source means the object does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementObject {
    key: StatementKey,
    source: String,
}

impl StatementObject {
    /// Creates a statement object.
    #[must_use]
    pub fn new(key: StatementKey, source: impl Into<String>) -> Self {
        Self {
            key,
            source: source.into(),
        }
    }

    /// Creates an empty statement object (the object does not exist).
    #[must_use]
    pub fn empty(key: StatementKey) -> Self {
        Self::new(key, String::new())
    }

    /// The populated key.
    #[must_use]
    pub const fn key(&self) -> StatementKey {
        self.key
    }

    /// Source for `key`, or `None` if another key was populated.
    #[must_use]
    pub fn get(&self, key: StatementKey) -> Option<&str> {
        (self.key == key).then_some(self.source.as_str())
    }

    /// The extracted source.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns whether the object was absent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Consumes and returns the source.
    #[must_use]
    pub fn into_source(self) -> String {
        self.source
    }
}

/// A procedure, function or trigger together with its engine-native source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProceduralObject {
    /// Object name.
    pub name: String,
    /// Object kind.
    pub kind: ObjectKind,
    /// Engine-native DDL.
    pub source: String,
    /// Owning table (triggers only).
    pub owner_table: Option<String>,
}

impl ProceduralObject {
    /// Creates a procedure.
    #[must_use]
    pub fn procedure(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Procedure,
            source: source.into(),
            owner_table: None,
        }
    }

    /// Creates a function.
    #[must_use]
    pub fn function(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Function,
            source: source.into(),
            owner_table: None,
        }
    }

    /// Creates a trigger on `table`.
    #[must_use]
    pub fn trigger(
        name: impl Into<String>,
        table: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Trigger,
            source: source.into(),
            owner_table: Some(table.into()),
        }
    }

    /// Identity key `(kind, name, owner_table)`.
    #[must_use]
    pub fn identity(&self) -> (ObjectKind, &str, Option<&str>) {
        (self.kind, &self.name, self.owner_table.as_deref())
    }
}
