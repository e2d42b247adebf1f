//! SQL dump writer.
//!
//! Produces a self-contained script: header and session settings, one section
//! per table (drop, create, indexes, data, sequence realignment), a deferred
//! foreign-key section, and a final completion marker. Output is written
//! incrementally through a buffered writer.

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::error::SnapResult;
use crate::models::schema::{ForeignKey, ReferentialAction, TableSchema};
use crate::models::value::{quote_ident, quote_ident_list, quote_literal, Cell};

/// Last line of every complete dump.
pub const DUMP_COMPLETE_MARKER: &str = "-- pgsnap dump complete";

const SESSION_SETTINGS: &[&str] = &[
    "SET statement_timeout = 0;",
    "SET lock_timeout = 0;",
    "SET idle_in_transaction_session_timeout = 0;",
    "SET client_encoding = 'UTF8';",
    "SET standard_conforming_strings = on;",
    "SET check_function_bodies = false;",
    "SET client_min_messages = warning;",
];

/// Identifying information written at the top of a dump.
#[derive(Debug, Clone)]
pub struct DumpHeader {
    pub database: String,
    pub schema: String,
    pub generated_at: DateTime<Utc>,
}

impl DumpHeader {
    pub fn new(database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self { database: database.into(), schema: schema.into(), generated_at: Utc::now() }
    }
}

/// Totals for a finished dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub tables: usize,
    pub rows: u64,
    pub foreign_keys: usize,
}

/// Incremental dump writer.
pub struct DumpWriter<W: AsyncWrite + Unpin> {
    out: BufWriter<W>,
    header: DumpHeader,
    deferred: Vec<(String, ForeignKey)>,
    summary: DumpSummary,
}

impl<W: AsyncWrite + Unpin> DumpWriter<W> {
    pub fn new(out: W, header: DumpHeader) -> Self {
        Self {
            out: BufWriter::new(out),
            header,
            deferred: Vec::new(),
            summary: DumpSummary::default(),
        }
    }

    /// Write the comment block and session settings.
    pub async fn write_header(&mut self) -> SnapResult<()> {
        let mut text = String::new();
        text.push_str("--\n-- pgsnap database dump\n--\n");
        text.push_str(&format!("-- Database: {}\n", self.header.database));
        text.push_str(&format!("-- Schema: {}\n", self.header.schema));
        text.push_str(&format!(
            "-- Generated at: {}\n",
            self.header.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        text.push_str("--\n\n");
        for setting in SESSION_SETTINGS {
            text.push_str(setting);
            text.push('\n');
        }
        text.push('\n');

        self.out.write_all(text.as_bytes()).await?;
        Ok(())
    }

    /// Write one table section, consuming its row stream. Returns rows written.
    ///
    /// Foreign keys are held back for the section written by [`finish`](Self::finish).
    pub async fn write_table<S>(&mut self, table: &TableSchema, rows: S) -> SnapResult<u64>
    where
        S: Stream<Item = SnapResult<Vec<Cell>>> + Unpin,
    {
        let name = quote_ident(&table.name);
        self.out.write_all(table_ddl(table).as_bytes()).await?;

        let mut rows = rows;
        let mut count: u64 = 0;
        if let Some(first) = rows.next().await {
            let first = first?;
            let columns = table
                .columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ");
            let prefix = if table.columns.is_empty() {
                format!("INSERT INTO {name} DEFAULT VALUES")
            } else {
                format!("INSERT INTO {name} ({columns}) VALUES (")
            };

            self.out.write_all(format!("-- Data for table {name}\n").as_bytes()).await?;
            self.write_insert(&prefix, &first).await?;
            count += 1;

            while let Some(row) = rows.next().await {
                self.write_insert(&prefix, &row?).await?;
                count += 1;
            }
            self.out.write_all(b"\n").await?;
        }

        let realign = sequence_realignment(table);
        if !realign.is_empty() {
            self.out.write_all(realign.as_bytes()).await?;
        }

        for fk in &table.foreign_keys {
            self.deferred.push((table.name.clone(), fk.clone()));
        }
        self.summary.tables += 1;
        self.summary.rows += count;

        tracing::debug!(table = %table.name, rows = count, "Table serialized");
        Ok(count)
    }

    async fn write_insert(&mut self, prefix: &str, row: &[Cell]) -> SnapResult<()> {
        let line = if row.is_empty() {
            format!("{prefix};\n")
        } else {
            let values = row.iter().map(Cell::to_sql_literal).collect::<Vec<_>>().join(", ");
            format!("{prefix}{values});\n")
        };
        self.out.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Write the foreign-key section and the completion marker, then flush.
    pub async fn finish(&mut self) -> SnapResult<DumpSummary> {
        if !self.deferred.is_empty() {
            let mut text = String::from("--\n-- Foreign key constraints\n--\n\n");
            for (table, fk) in &self.deferred {
                text.push_str(&foreign_key_sql(table, fk));
                text.push('\n');
            }
            text.push('\n');
            self.out.write_all(text.as_bytes()).await?;
        }
        self.summary.foreign_keys = self.deferred.len();

        self.out.write_all(format!("{DUMP_COMPLETE_MARKER}\n").as_bytes()).await?;
        self.out.flush().await?;
        Ok(self.summary)
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

/// Write a whole dump from already-described tables and their row streams.
pub async fn write_dump<W, S>(
    out: W,
    header: DumpHeader,
    tables: Vec<(TableSchema, S)>,
) -> SnapResult<(W, DumpSummary)>
where
    W: AsyncWrite + Unpin,
    S: Stream<Item = SnapResult<Vec<Cell>>> + Unpin,
{
    let mut writer = DumpWriter::new(out, header);
    writer.write_header().await?;
    for (table, rows) in tables {
        writer.write_table(&table, rows).await?;
    }
    let summary = writer.finish().await?;
    Ok((writer.into_inner(), summary))
}

/// Comment, drop, sequences, create, and index statements for one table.
fn table_ddl(table: &TableSchema) -> String {
    let name = quote_ident(&table.name);
    let mut out = format!("--\n-- Table {name}\n--\n\n");

    out.push_str(&format!("DROP TABLE IF EXISTS {name} CASCADE;\n"));

    for (_, sequence) in table.sequences() {
        out.push_str(&format!("CREATE SEQUENCE IF NOT EXISTS {sequence};\n"));
    }

    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut line = format!("    {} {}", quote_ident(&c.name), c.type_sql());
            if let Some(default) = &c.default {
                line.push_str(&format!(" DEFAULT {default}"));
            }
            if !c.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();
    if !table.primary_key.is_empty() {
        lines.push(format!("    PRIMARY KEY ({})", quote_ident_list(&table.primary_key)));
    }
    if lines.is_empty() {
        out.push_str(&format!("CREATE TABLE IF NOT EXISTS {name} ();\n"));
    } else {
        out.push_str(&format!("CREATE TABLE IF NOT EXISTS {name} (\n{}\n);\n", lines.join(",\n")));
    }

    for index in &table.indexes {
        out.push_str(&index.idempotent_sql());
        out.push_str(";\n");
    }
    out.push('\n');
    out
}

/// `setval` calls moving each sequence past the restored data.
fn sequence_realignment(table: &TableSchema) -> String {
    let name = quote_ident(&table.name);
    let mut out = String::new();
    for (column, sequence) in table.sequences() {
        let col = quote_ident(&column.name);
        out.push_str(&format!(
            "SELECT pg_catalog.setval({}, COALESCE(MAX({col}), 1), MAX({col}) IS NOT NULL) FROM {name};\n",
            quote_literal(sequence)
        ));
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn foreign_key_sql(table: &str, fk: &ForeignKey) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        quote_ident(table),
        quote_ident(&fk.name),
        quote_ident_list(&fk.columns),
        quote_ident(&fk.referenced_table),
        quote_ident_list(&fk.referenced_columns),
    );
    if fk.on_delete != ReferentialAction::NoAction {
        sql.push_str(&format!(" ON DELETE {}", fk.on_delete.as_sql()));
    }
    if fk.on_update != ReferentialAction::NoAction {
        sql.push_str(&format!(" ON UPDATE {}", fk.on_update.as_sql()));
    }
    sql.push(';');
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::{ColumnDef, IndexDef};
    use futures_util::stream;

    fn users() -> TableSchema {
        TableSchema {
            name: "users".to_string(),
            columns: vec![
                ColumnDef {
                    name: "id".to_string(),
                    data_type: "integer".to_string(),
                    type_name: "int4".to_string(),
                    max_length: None,
                    default: Some("nextval('users_id_seq'::regclass)".to_string()),
                    nullable: false,
                },
                ColumnDef {
                    name: "email".to_string(),
                    data_type: "character varying(255)".to_string(),
                    type_name: "varchar".to_string(),
                    max_length: Some(255),
                    default: None,
                    nullable: false,
                },
            ],
            primary_key: vec!["id".to_string()],
            foreign_keys: vec![],
            indexes: vec![IndexDef {
                name: "users_email_key".to_string(),
                definition: "CREATE UNIQUE INDEX users_email_key ON users USING btree (email)"
                    .to_string(),
                unique: true,
            }],
        }
    }

    #[test]
    fn test_table_ddl_order() {
        let ddl = table_ddl(&users());
        let drop = ddl.find("DROP TABLE IF EXISTS \"users\" CASCADE;").unwrap();
        let seq = ddl.find("CREATE SEQUENCE IF NOT EXISTS users_id_seq;").unwrap();
        let create = ddl.find("CREATE TABLE IF NOT EXISTS \"users\" (").unwrap();
        let index = ddl.find("CREATE UNIQUE INDEX IF NOT EXISTS users_email_key").unwrap();
        assert!(drop < seq && seq < create && create < index);
        assert!(ddl.contains("\"email\" character varying(255) NOT NULL"));
        assert!(ddl.contains("    PRIMARY KEY (\"id\")\n);"));
    }

    #[test]
    fn test_foreign_key_actions() {
        let fk = ForeignKey {
            name: "orders_user_id_fkey".to_string(),
            columns: vec!["user_id".to_string()],
            referenced_table: "users".to_string(),
            referenced_columns: vec!["id".to_string()],
            on_delete: ReferentialAction::Cascade,
            on_update: ReferentialAction::NoAction,
        };
        assert_eq!(
            foreign_key_sql("orders", &fk),
            "ALTER TABLE \"orders\" ADD CONSTRAINT \"orders_user_id_fkey\" FOREIGN KEY (\"user_id\") \
             REFERENCES \"users\" (\"id\") ON DELETE CASCADE;"
        );
    }

    #[tokio::test]
    async fn test_dump_ends_with_marker_and_realigns_sequence() {
        let rows = stream::iter(vec![Ok(vec![
            Cell::Number("1".to_string()),
            Cell::Text("a@example.com".to_string()),
        ])]);
        let (out, summary) =
            write_dump(Vec::new(), DumpHeader::new("app", "public"), vec![(users(), rows)])
                .await
                .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(summary.tables, 1);
        assert_eq!(summary.rows, 1);
        assert!(text.contains("SET standard_conforming_strings = on;"));
        assert!(text.contains("INSERT INTO \"users\" (\"id\", \"email\") VALUES (1, 'a@example.com');"));
        assert!(text.contains(
            "SELECT pg_catalog.setval('users_id_seq', COALESCE(MAX(\"id\"), 1), MAX(\"id\") IS NOT NULL) FROM \"users\";"
        ));
        assert!(!text.contains("Foreign key constraints"));
        assert_eq!(text.trim_end().lines().last(), Some(DUMP_COMPLETE_MARKER));
    }

    #[tokio::test]
    async fn test_table_without_columns_keeps_row_count() {
        let marker = TableSchema {
            name: "marker".to_string(),
            columns: vec![],
            primary_key: vec![],
            foreign_keys: vec![],
            indexes: vec![],
        };
        let rows = stream::iter(vec![Ok(vec![]), Ok(vec![])]);
        let (out, summary) =
            write_dump(Vec::new(), DumpHeader::new("app", "public"), vec![(marker, rows)])
                .await
                .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(summary.rows, 2);
        assert!(text.contains("CREATE TABLE IF NOT EXISTS \"marker\" ();\n"));
        assert_eq!(text.matches("INSERT INTO \"marker\" DEFAULT VALUES;\n").count(), 2);
    }

    #[tokio::test]
    async fn test_row_error_leaves_dump_without_marker() {
        let rows = stream::iter(vec![
            Ok(vec![Cell::Number("1".to_string()), Cell::Text("x".to_string())]),
            Err(crate::error::SnapError::serialization("bad value")),
        ]);
        let mut writer = DumpWriter::new(Vec::new(), DumpHeader::new("app", "public"));
        writer.write_header().await.unwrap();
        assert!(writer.write_table(&users(), rows).await.is_err());

        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert!(!text.contains(DUMP_COMPLETE_MARKER));
    }
}
