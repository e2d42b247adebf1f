//! Table description models.
//!
//! Data structures produced by catalog introspection and consumed by the
//! dump writer. All of them are immutable once built.

use serde::{Deserialize, Serialize};

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type as rendered by `format_type` (e.g., "character varying(255)").
    pub data_type: String,
    /// Base type name from `pg_type.typname` (e.g., "varchar", "int4", "_text").
    pub type_name: String,
    /// Character maximum length, for length-limited character types.
    pub max_length: Option<i32>,
    /// Default value expression, if any.
    pub default: Option<String>,
    /// Whether the column allows NULL values.
    pub nullable: bool,
}

impl ColumnDef {
    /// Type text for `CREATE TABLE`, with the max length appended when the
    /// declared type does not already carry one.
    pub fn type_sql(&self) -> String {
        match self.max_length {
            Some(len) if !self.data_type.contains('(') => format!("{}({len})", self.data_type),
            _ => self.data_type.clone(),
        }
    }

    /// Sequence named by a `nextval('<seq>'::regclass)` default.
    pub fn owned_sequence(&self) -> Option<&str> {
        let default = self.default.as_deref()?.trim();
        let inner = default.strip_prefix("nextval('")?;
        let end = inner.find("'::regclass)")?;
        Some(&inner[..end])
    }
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Referencing columns, in key order.
    pub columns: Vec<String>,
    /// Referenced table.
    pub referenced_table: String,
    /// Referenced columns, paired with `columns`.
    pub referenced_columns: Vec<String>,
    /// ON DELETE action.
    pub on_delete: ReferentialAction,
    /// ON UPDATE action.
    pub on_update: ReferentialAction,
}

/// Referential action of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Parse the single-letter code stored in `pg_constraint.confdeltype`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "r" => Self::Restrict,
            "c" => Self::Cascade,
            "n" => Self::SetNull,
            "d" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    /// SQL spelling.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// A single foreign-key edge: local column to referenced table and column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyEdge<'a> {
    pub column: &'a str,
    pub referenced_table: &'a str,
    pub referenced_column: &'a str,
}

/// A non-primary-key index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Full `CREATE INDEX` statement from `pg_get_indexdef`.
    pub definition: String,
    /// Whether the index is unique.
    pub unique: bool,
}

impl IndexDef {
    /// Definition rewritten to `CREATE [UNIQUE] INDEX IF NOT EXISTS`.
    pub fn idempotent_sql(&self) -> String {
        let def = self.definition.trim();
        for prefix in ["CREATE UNIQUE INDEX ", "CREATE INDEX "] {
            if let Some(rest) = def.strip_prefix(prefix) {
                let rest = rest.strip_prefix("IF NOT EXISTS ").unwrap_or(rest);
                return format!("{prefix}IF NOT EXISTS {rest}");
            }
        }
        def.to_string()
    }
}

/// Complete description of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Primary key columns in key order. Empty when the table has none.
    pub primary_key: Vec<String>,
    /// Foreign keys, ordered by constraint name.
    pub foreign_keys: Vec<ForeignKey>,
    /// Non-primary-key indexes, ordered by name.
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    /// Flattened list of foreign-key column pairs.
    pub fn foreign_key_edges(&self) -> Vec<ForeignKeyEdge<'_>> {
        self.foreign_keys
            .iter()
            .flat_map(|fk| {
                fk.columns.iter().zip(&fk.referenced_columns).map(move |(col, ref_col)| {
                    ForeignKeyEdge {
                        column: col,
                        referenced_table: &fk.referenced_table,
                        referenced_column: ref_col,
                    }
                })
            })
            .collect()
    }

    /// Columns whose default draws from a sequence, paired with that sequence.
    pub fn sequences(&self) -> Vec<(&ColumnDef, &str)> {
        self.columns.iter().filter_map(|c| c.owned_sequence().map(|seq| (c, seq))).collect()
    }
}
