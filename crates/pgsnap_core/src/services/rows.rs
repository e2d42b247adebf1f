//! Streaming row reads for the dump writer.
//!
//! Each column gets a [`Decoder`] chosen from its base type name. Types the
//! driver maps natively are read as such; everything else is selected as
//! `::text` so the server does the stringification.

use std::pin::Pin;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio_postgres::types::{Date as PgDate, FromSql, Timestamp as PgTimestamp};
use tokio_postgres::Row;

use crate::error::{SnapError, SnapResult};
use crate::models::schema::{ColumnDef, TableSchema};
use crate::models::value::{quote_ident, quote_ident_list, Cell};
use crate::services::connection::Database;

/// How a column is selected and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    /// `numeric`, selected as text and emitted unquoted.
    Numeric,
    Text,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    /// `json` and `jsonb`, selected as text so the server's rendering is kept.
    Json,
    /// Any other type, selected as text and emitted quoted.
    Stringified,
}

impl Decoder {
    /// Choose a decoder from a `pg_type.typname`.
    pub fn for_type(type_name: &str) -> Self {
        match type_name {
            "bool" => Self::Bool,
            "int2" => Self::Int2,
            "int4" => Self::Int4,
            "int8" => Self::Int8,
            "oid" => Self::Oid,
            "float4" => Self::Float4,
            "float8" => Self::Float8,
            "numeric" => Self::Numeric,
            "text" | "varchar" | "bpchar" | "name" => Self::Text,
            "uuid" => Self::Uuid,
            "timestamp" => Self::Timestamp,
            "timestamptz" => Self::TimestampTz,
            "date" => Self::Date,
            "json" | "jsonb" => Self::Json,
            _ => Self::Stringified,
        }
    }

    fn casts_to_text(&self) -> bool {
        matches!(self, Self::Numeric | Self::Json | Self::Stringified)
    }
}

/// Select list and decoders for one table.
#[derive(Debug, Clone)]
pub struct RowPlan {
    table: String,
    columns: Vec<(String, Decoder)>,
    sql: String,
}

impl RowPlan {
    pub fn new(schema: &str, table: &TableSchema) -> Self {
        let columns: Vec<(String, Decoder)> = table
            .columns
            .iter()
            .map(|c: &ColumnDef| (c.name.clone(), Decoder::for_type(&c.type_name)))
            .collect();

        let select_list = columns
            .iter()
            .map(|(name, decoder)| {
                if decoder.casts_to_text() {
                    format!("{}::text", quote_ident(name))
                } else {
                    quote_ident(name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let order_by = if table.primary_key.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", quote_ident_list(&table.primary_key))
        };

        // A table without columns still has rows; `SELECT FROM` counts them.
        let select = if select_list.is_empty() {
            "SELECT".to_string()
        } else {
            format!("SELECT {select_list}")
        };
        let sql = format!(
            "{select} FROM {}.{}{order_by}",
            quote_ident(schema),
            quote_ident(&table.name)
        );

        Self { table: table.name.clone(), columns, sql }
    }

    /// The `SELECT` statement.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn decoders(&self) -> impl Iterator<Item = Decoder> + '_ {
        self.columns.iter().map(|(_, d)| *d)
    }

    /// Decode one row into cells, in column order.
    pub fn decode(&self, row: &Row) -> SnapResult<Vec<Cell>> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, (name, decoder))| {
                decode_cell(row, idx, *decoder).map_err(|e| {
                    SnapError::serialization(format!(
                        "Cannot read column \"{name}\" of table \"{}\": {e}",
                        self.table
                    ))
                })
            })
            .collect()
    }
}

/// Stream of decoded rows.
pub type CellStream<'a> = Pin<Box<dyn Stream<Item = SnapResult<Vec<Cell>>> + Send + 'a>>;

/// Start streaming the rows of `table`.
pub async fn stream_rows<'a>(
    db: &'a Database,
    schema: &str,
    table: &TableSchema,
) -> SnapResult<CellStream<'a>> {
    let plan = RowPlan::new(schema, table);
    let name = table.name.clone();

    let rows = db
        .query_stream(plan.sql())
        .await
        .map_err(|e| SnapError::introspection(name.as_str(), e))?;

    let stream = rows.map(move |row| match row {
        Ok(row) => plan.decode(&row),
        Err(e) => Err(SnapError::introspection(name.as_str(), SnapError::from(e))),
    });
    Ok(Box::pin(stream))
}

fn get<'a, T: FromSql<'a>>(
    row: &'a Row,
    idx: usize,
) -> Result<Option<T>, tokio_postgres::Error> {
    row.try_get::<_, Option<T>>(idx)
}

fn decode_cell(row: &Row, idx: usize, decoder: Decoder) -> Result<Cell, tokio_postgres::Error> {
    let cell = match decoder {
        Decoder::Bool => get::<bool>(row, idx)?.map(Cell::Bool),
        Decoder::Int2 => get::<i16>(row, idx)?.map(|v| Cell::Number(v.to_string())),
        Decoder::Int4 => get::<i32>(row, idx)?.map(|v| Cell::Number(v.to_string())),
        Decoder::Int8 => get::<i64>(row, idx)?.map(|v| Cell::Number(v.to_string())),
        Decoder::Oid => get::<u32>(row, idx)?.map(|v| Cell::Number(v.to_string())),
        Decoder::Float4 => get::<f32>(row, idx)?.map(Cell::from_f32),
        Decoder::Float8 => get::<f64>(row, idx)?.map(Cell::from_f64),
        Decoder::Numeric => get::<String>(row, idx)?.map(|v| {
            // numeric NaN and infinities are not valid bare literals
            if v.chars().any(|c| c.is_ascii_digit()) {
                Cell::Number(v)
            } else {
                Cell::Text(v)
            }
        }),
        Decoder::Text | Decoder::Stringified => get::<String>(row, idx)?.map(Cell::Text),
        Decoder::Uuid => get::<uuid::Uuid>(row, idx)?.map(|v| Cell::Text(v.to_string())),
        Decoder::Timestamp => {
            get::<PgTimestamp<NaiveDateTime>>(row, idx)?.map(|v| Cell::Timestamp(timestamp_text(v)))
        }
        Decoder::TimestampTz => get::<PgTimestamp<DateTime<Utc>>>(row, idx)?
            .map(|v| Cell::Timestamp(timestamptz_text(v))),
        Decoder::Date => get::<PgDate<NaiveDate>>(row, idx)?.map(|v| Cell::Timestamp(date_text(v))),
        Decoder::Json => get::<String>(row, idx)?.map(Cell::Json),
    };

    Ok(cell.unwrap_or(Cell::Null))
}

// Years are written by hand: chrono renders 1 BC as year 0 and prefixes
// years past 9999 with `+`, neither of which the server accepts.

fn timestamp_text(value: PgTimestamp<NaiveDateTime>) -> String {
    match value {
        PgTimestamp::PosInfinity => "infinity".to_string(),
        PgTimestamp::NegInfinity => "-infinity".to_string(),
        PgTimestamp::Value(v) if v.year() > 0 => {
            format!("{:04}-{}", v.year(), v.format("%m-%dT%H:%M:%S%.f"))
        }
        PgTimestamp::Value(v) => format!("{:04}-{} BC", 1 - v.year(), v.format("%m-%d %H:%M:%S%.f")),
    }
}

fn timestamptz_text(value: PgTimestamp<DateTime<Utc>>) -> String {
    match value {
        PgTimestamp::PosInfinity => "infinity".to_string(),
        PgTimestamp::NegInfinity => "-infinity".to_string(),
        PgTimestamp::Value(v) if v.year() > 0 => {
            format!("{:04}-{}Z", v.year(), v.format("%m-%dT%H:%M:%S%.f"))
        }
        PgTimestamp::Value(v) => {
            format!("{:04}-{}+00 BC", 1 - v.year(), v.format("%m-%d %H:%M:%S%.f"))
        }
    }
}

fn date_text(value: PgDate<NaiveDate>) -> String {
    match value {
        PgDate::PosInfinity => "infinity".to_string(),
        PgDate::NegInfinity => "-infinity".to_string(),
        PgDate::Value(v) if v.year() > 0 => format!("{:04}-{}", v.year(), v.format("%m-%d")),
        PgDate::Value(v) => format!("{:04}-{} BC", 1 - v.year(), v.format("%m-%d")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::types::Type;

    fn column(name: &str, type_name: &str) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            data_type: type_name.to_string(),
            type_name: type_name.to_string(),
            max_length: None,
            default: None,
            nullable: true,
        }
    }

    #[test]
    fn test_decoder_selection() {
        assert_eq!(Decoder::for_type("bool"), Decoder::Bool);
        assert_eq!(Decoder::for_type("bpchar"), Decoder::Text);
        assert_eq!(Decoder::for_type("jsonb"), Decoder::Json);
        assert_eq!(Decoder::for_type("timestamptz"), Decoder::TimestampTz);
        assert_eq!(Decoder::for_type("inet"), Decoder::Stringified);
        assert_eq!(Decoder::for_type("_int4"), Decoder::Stringified);
    }

    #[test]
    fn test_plan_casts_unknown_types_and_orders_by_key() {
        let table = TableSchema {
            name: "events".to_string(),
            columns: vec![
                column("id", "int8"),
                column("amount", "numeric"),
                column("source", "inet"),
                column("payload", "jsonb"),
            ],
            primary_key: vec!["id".to_string()],
            foreign_keys: vec![],
            indexes: vec![],
        };

        let plan = RowPlan::new("public", &table);
        assert_eq!(
            plan.sql(),
            "SELECT \"id\", \"amount\"::text, \"source\"::text, \"payload\"::text \
             FROM \"public\".\"events\" ORDER BY \"id\""
        );
        assert_eq!(plan.decoders().count(), 4);
    }

    #[test]
    fn test_plan_without_primary_key_has_no_order() {
        let table = TableSchema {
            name: "log".to_string(),
            columns: vec![column("line", "text")],
            primary_key: vec![],
            foreign_keys: vec![],
            indexes: vec![],
        };
        assert_eq!(RowPlan::new("app", &table).sql(), "SELECT \"line\" FROM \"app\".\"log\"");
    }

    #[test]
    fn test_plan_for_table_without_columns() {
        let table = TableSchema {
            name: "marker".to_string(),
            columns: vec![],
            primary_key: vec![],
            foreign_keys: vec![],
            indexes: vec![],
        };
        assert_eq!(RowPlan::new("public", &table).sql(), "SELECT FROM \"public\".\"marker\"");
    }

    #[test]
    fn test_infinite_timestamps_decode_to_keywords() {
        let pos = PgTimestamp::<NaiveDateTime>::from_sql(&Type::TIMESTAMP, &i64::MAX.to_be_bytes())
            .unwrap();
        assert_eq!(timestamp_text(pos), "infinity");

        let neg =
            PgTimestamp::<DateTime<Utc>>::from_sql(&Type::TIMESTAMPTZ, &i64::MIN.to_be_bytes())
                .unwrap();
        assert_eq!(timestamptz_text(neg), "-infinity");

        let date = PgDate::<NaiveDate>::from_sql(&Type::DATE, &i32::MAX.to_be_bytes()).unwrap();
        assert_eq!(date_text(date), "infinity");
        assert_eq!(Cell::Timestamp(date_text(PgDate::NegInfinity)).to_sql_literal(), "'-infinity'");
    }

    #[test]
    fn test_timestamp_text_forms() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(12, 34, 56, 789)
            .unwrap();
        assert_eq!(timestamp_text(PgTimestamp::Value(at)), "2024-03-01T12:34:56.789");
        assert_eq!(timestamptz_text(PgTimestamp::Value(at.and_utc())), "2024-03-01T12:34:56.789Z");

        let far = NaiveDate::from_ymd_opt(10000, 1, 1).unwrap();
        assert_eq!(date_text(PgDate::Value(far)), "10000-01-01");
    }

    #[test]
    fn test_bc_dates_use_era_suffix() {
        // chrono year -43 is 44 BC.
        let ides = NaiveDate::from_ymd_opt(-43, 3, 15).unwrap();
        assert_eq!(date_text(PgDate::Value(ides)), "0044-03-15 BC");

        let noon = ides.and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(timestamp_text(PgTimestamp::Value(noon)), "0044-03-15 12:00:00 BC");
        assert_eq!(timestamptz_text(PgTimestamp::Value(noon.and_utc())), "0044-03-15 12:00:00+00 BC");

        let first_bc = NaiveDate::from_ymd_opt(0, 1, 1).unwrap();
        assert_eq!(date_text(PgDate::Value(first_bc)), "0001-01-01 BC");
    }
}
