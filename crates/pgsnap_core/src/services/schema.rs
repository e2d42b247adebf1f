//! Schema introspection service.
//!
//! Queries PostgreSQL system catalogs to enumerate the tables of a schema and
//! describe each one: columns, primary key, foreign keys, and indexes.

use std::collections::BTreeMap;

use crate::error::{SnapError, SnapResult};
use crate::models::schema::{ColumnDef, ForeignKey, IndexDef, ReferentialAction, TableSchema};
use crate::models::value::quote_ident;
use crate::services::connection::Database;

/// Schema introspection service.
pub struct SchemaService;

impl SchemaService {
    /// Make `schema` the session's only user schema.
    ///
    /// Catalog renderers (`format_type`, `pg_get_expr`, `pg_get_indexdef`)
    /// qualify names only when they are not visible, so objects of the dumped
    /// schema come out unqualified and restore into the target's own schema.
    pub async fn pin_search_path(db: &Database, schema: &str) -> SnapResult<()> {
        db.batch_execute(&Self::search_path_sql(schema)).await?;
        tracing::debug!(schema, "Search path pinned");
        Ok(())
    }

    fn search_path_sql(schema: &str) -> String {
        format!("SET search_path = {}, pg_catalog", quote_ident(schema))
    }

    /// List ordinary and partitioned tables in `schema`, sorted and deduplicated.
    pub async fn list_tables(db: &Database, schema: &str) -> SnapResult<Vec<String>> {
        let rows = db
            .query(
                r#"
                SELECT c.relname AS name
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relkind IN ('r', 'p')
                  AND NOT c.relispartition
                ORDER BY c.relname
                "#,
                &[&schema],
            )
            .await?;

        let mut tables: Vec<String> = rows.into_iter().map(|row| row.get("name")).collect();
        tables.sort();
        tables.dedup();

        tracing::debug!(schema, count = tables.len(), "Tables listed");
        Ok(tables)
    }

    /// Describe one table. Any catalog failure names the table.
    pub async fn describe(db: &Database, schema: &str, table: &str) -> SnapResult<TableSchema> {
        let wrap = |e: SnapError| SnapError::introspection(table, e);

        let columns = Self::load_columns(db, schema, table).await.map_err(wrap)?;
        // `CREATE TABLE t ()` is legal, so no columns alone proves nothing.
        if columns.is_empty() && !Self::table_exists(db, schema, table).await.map_err(wrap)? {
            return Err(SnapError::Introspection {
                table: table.to_string(),
                message: "table no longer exists".to_string(),
                code: None,
            });
        }
        let primary_key = Self::load_primary_key(db, schema, table).await.map_err(wrap)?;
        let foreign_keys = Self::load_foreign_keys(db, schema, table).await.map_err(wrap)?;
        let indexes = Self::load_indexes(db, schema, table).await.map_err(wrap)?;

        tracing::debug!(
            table,
            columns = columns.len(),
            primary_key = primary_key.len(),
            foreign_keys = foreign_keys.len(),
            indexes = indexes.len(),
            "Table described"
        );

        Ok(TableSchema { name: table.to_string(), columns, primary_key, foreign_keys, indexes })
    }

    async fn table_exists(db: &Database, schema: &str, table: &str) -> SnapResult<bool> {
        let rows = db
            .query(
                r#"
                SELECT EXISTS (
                    SELECT 1
                    FROM pg_catalog.pg_class c
                    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                    WHERE n.nspname = $1
                      AND c.relname = $2
                      AND c.relkind IN ('r', 'p')
                ) AS present
                "#,
                &[&schema, &table],
            )
            .await?;
        Ok(rows.first().map(|row| row.get::<_, bool>("present")).unwrap_or(false))
    }

    /// Columns in declaration order.
    async fn load_columns(db: &Database, schema: &str, table: &str) -> SnapResult<Vec<ColumnDef>> {
        let rows = db
            .query(
                r#"
                SELECT
                    a.attname AS name,
                    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                    t.typname::text AS type_name,
                    CASE
                        WHEN t.typname IN ('varchar', 'bpchar') AND a.atttypmod > 4
                        THEN a.atttypmod - 4
                    END AS max_length,
                    pg_catalog.pg_get_expr(d.adbin, d.adrelid) AS default_value,
                    NOT a.attnotnull AS nullable
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
                LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                ORDER BY a.attnum
                "#,
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ColumnDef {
                name: row.get("name"),
                data_type: row.get("data_type"),
                type_name: row.get("type_name"),
                max_length: row.get("max_length"),
                default: row.get("default_value"),
                nullable: row.get("nullable"),
            })
            .collect())
    }

    /// Primary key columns in key order.
    async fn load_primary_key(db: &Database, schema: &str, table: &str) -> SnapResult<Vec<String>> {
        let rows = db
            .query(
                r#"
                SELECT a.attname AS name
                FROM pg_catalog.pg_index i
                JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND i.indisprimary
                ORDER BY array_position(i.indkey::int2[], a.attnum)
                "#,
                &[&schema, &table],
            )
            .await?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// Foreign keys, one entry per constraint with columns in key order.
    async fn load_foreign_keys(
        db: &Database,
        schema: &str,
        table: &str,
    ) -> SnapResult<Vec<ForeignKey>> {
        let rows = db
            .query(
                r#"
                SELECT
                    con.conname::text AS name,
                    la.attname AS column_name,
                    rc.relname AS referenced_table,
                    ra.attname AS referenced_column,
                    con.confdeltype::text AS on_delete,
                    con.confupdtype::text AS on_update,
                    k.ord AS ord
                FROM pg_catalog.pg_constraint con
                JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
                CROSS JOIN LATERAL unnest(con.conkey, con.confkey)
                    WITH ORDINALITY AS k(local_attnum, ref_attnum, ord)
                JOIN pg_catalog.pg_attribute la
                    ON la.attrelid = con.conrelid AND la.attnum = k.local_attnum
                JOIN pg_catalog.pg_attribute ra
                    ON ra.attrelid = con.confrelid AND ra.attnum = k.ref_attnum
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND con.contype = 'f'
                ORDER BY con.conname, k.ord
                "#,
                &[&schema, &table],
            )
            .await?;

        let mut grouped: BTreeMap<String, ForeignKey> = BTreeMap::new();
        for row in rows {
            let name: String = row.get("name");
            let on_delete: String = row.get("on_delete");
            let on_update: String = row.get("on_update");

            let fk = grouped.entry(name.clone()).or_insert_with(|| ForeignKey {
                name,
                columns: Vec::new(),
                referenced_table: row.get("referenced_table"),
                referenced_columns: Vec::new(),
                on_delete: ReferentialAction::from_code(&on_delete),
                on_update: ReferentialAction::from_code(&on_update),
            });
            fk.columns.push(row.get("column_name"));
            fk.referenced_columns.push(row.get("referenced_column"));
        }

        Ok(grouped.into_values().collect())
    }

    /// Non-primary-key indexes, ordered by name.
    async fn load_indexes(db: &Database, schema: &str, table: &str) -> SnapResult<Vec<IndexDef>> {
        let rows = db
            .query(
                r#"
                SELECT
                    ic.relname AS name,
                    pg_catalog.pg_get_indexdef(i.indexrelid, 0, true) AS definition,
                    i.indisunique AS is_unique
                FROM pg_catalog.pg_index i
                JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
                JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND NOT i.indisprimary
                ORDER BY ic.relname
                "#,
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| IndexDef {
                name: row.get("name"),
                definition: row.get("definition"),
                unique: row.get("is_unique"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_path_quotes_schema() {
        assert_eq!(SchemaService::search_path_sql("app"), "SET search_path = \"app\", pg_catalog");
        assert_eq!(
            SchemaService::search_path_sql("Odd\"Name"),
            "SET search_path = \"Odd\"\"Name\", pg_catalog"
        );
    }
}
