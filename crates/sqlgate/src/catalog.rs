//! Catalog operations
//!
//! Fixed, parameterized queries against `information_schema`, run through
//! [`QueryExecutor::read_catalog`] so they always use a read-only
//! transaction that is rolled back.

use serde::Serialize;
use sqlgate_rdbc::security::{quote_qualified, validate_sql_identifier};
use sqlgate_rdbc::types::{ResultSet, Value};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::executor::QueryExecutor;

/// Schema searched when the caller names none
pub const DEFAULT_SCHEMA: &str = "public";

const LIST_SCHEMAS_SQL: &str = "\
SELECT schema_name::text AS schema_name
FROM information_schema.schemata
WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
  AND schema_name NOT LIKE 'pg\\_toast%'
  AND schema_name NOT LIKE 'pg\\_temp\\_%'
ORDER BY schema_name";

const LIST_TABLES_SQL: &str = "\
SELECT table_name::text AS table_name, table_type::text AS table_type
FROM information_schema.tables
WHERE table_schema = $1::text
ORDER BY table_name";

const DESCRIBE_TABLE_SQL: &str = "\
SELECT c.column_name::text AS column_name,
       c.data_type::text AS data_type,
       c.is_nullable = 'YES' AS nullable,
       c.column_default::text AS column_default,
       EXISTS (
           SELECT 1
           FROM information_schema.table_constraints tc
           JOIN information_schema.key_column_usage k
             ON k.constraint_schema = tc.constraint_schema
            AND k.constraint_name = tc.constraint_name
           WHERE tc.constraint_type = 'PRIMARY KEY'
             AND tc.table_schema = c.table_schema
             AND tc.table_name = c.table_name
             AND k.column_name = c.column_name
       ) AS primary_key
FROM information_schema.columns c
WHERE c.table_schema = $1::text
  AND c.table_name = $2::text
ORDER BY c.ordinal_position";

const HEALTH_CHECK_SQL: &str = "\
SELECT version() AS version,
       current_database()::text AS database,
       current_user::text AS current_user";

/// Schemas visible on a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaList {
    /// Target label
    pub label: String,
    /// Schema names
    pub schemas: Vec<String>,
}

/// One table or view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    /// Table name
    pub name: String,
    /// `BASE TABLE`, `VIEW`, ...
    pub table_type: String,
}

/// Tables in one schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableList {
    /// Target label
    pub label: String,
    /// Schema searched
    pub schema: String,
    /// Tables in name order
    pub tables: Vec<TableEntry>,
}

/// One column of a described table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescription {
    /// Column name
    pub name: String,
    /// SQL data type
    pub data_type: String,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Default expression
    pub default: Option<String>,
    /// Whether the column is part of the primary key
    pub primary_key: bool,
}

/// Column layout of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescription {
    /// Target label
    pub label: String,
    /// Quoted, schema-qualified table name
    pub table: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDescription>,
}

/// Reachability report for one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Target label
    pub label: String,
    /// `version()` output
    pub server_version: String,
    /// Connected database
    pub database: String,
    /// Connected role
    pub user: String,
    /// Round trip of the health query, including borrow
    pub latency_ms: f64,
}

/// List user schemas
pub async fn list_schemas(executor: &QueryExecutor, label: &str) -> Result<SchemaList> {
    let rs = executor.read_catalog(label, LIST_SCHEMAS_SQL, &[]).await?;
    Ok(SchemaList {
        label: label.to_string(),
        schemas: (0..rs.len())
            .filter_map(|i| text(&rs, i, "schema_name"))
            .collect(),
    })
}

/// List tables and views in `schema` (default `public`)
pub async fn list_tables(
    executor: &QueryExecutor,
    label: &str,
    schema: Option<&str>,
) -> Result<TableList> {
    let schema = identifier("schema", schema.unwrap_or(DEFAULT_SCHEMA))?;
    let rs = executor
        .read_catalog(label, LIST_TABLES_SQL, &[Value::from(schema)])
        .await?;

    let tables = (0..rs.len())
        .filter_map(|i| {
            Some(TableEntry {
                name: text(&rs, i, "table_name")?,
                table_type: text(&rs, i, "table_type").unwrap_or_default(),
            })
        })
        .collect();

    Ok(TableList {
        label: label.to_string(),
        schema: schema.to_string(),
        tables,
    })
}

/// Describe the columns of `schema.table` (schema default `public`)
pub async fn describe_table(
    executor: &QueryExecutor,
    label: &str,
    table: &str,
    schema: Option<&str>,
) -> Result<TableDescription> {
    let schema = identifier("schema", schema.unwrap_or(DEFAULT_SCHEMA))?;
    let table = identifier("table", table)?;
    let qualified = quote_qualified(Some(schema), table);

    let rs = executor
        .read_catalog(
            label,
            DESCRIBE_TABLE_SQL,
            &[Value::from(schema), Value::from(table)],
        )
        .await?;

    if rs.is_empty() {
        return Err(Error::Execution {
            message: format!("relation {qualified} does not exist"),
            sqlstate: Some("42P01".into()),
        });
    }

    let columns = (0..rs.len())
        .filter_map(|i| {
            Some(ColumnDescription {
                name: text(&rs, i, "column_name")?,
                data_type: text(&rs, i, "data_type").unwrap_or_default(),
                nullable: flag(&rs, i, "nullable"),
                default: text(&rs, i, "column_default"),
                primary_key: flag(&rs, i, "primary_key"),
            })
        })
        .collect();

    Ok(TableDescription {
        label: label.to_string(),
        table: qualified,
        columns,
    })
}

/// Check that a target answers, reporting who and where we are connected
pub async fn health_check(executor: &QueryExecutor, label: &str) -> Result<HealthReport> {
    let start = Instant::now();
    let rs = executor.read_catalog(label, HEALTH_CHECK_SQL, &[]).await?;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    Ok(HealthReport {
        label: label.to_string(),
        server_version: text(&rs, 0, "version").unwrap_or_default(),
        database: text(&rs, 0, "database").unwrap_or_default(),
        user: text(&rs, 0, "current_user").unwrap_or_default(),
        latency_ms,
    })
}

fn identifier<'a>(what: &str, name: &'a str) -> Result<&'a str> {
    validate_sql_identifier(name)
        .map_err(|e| Error::invalid_input(format!("{what}: {e}")))?;
    Ok(name)
}

fn text(rs: &ResultSet, row: usize, column: &str) -> Option<String> {
    rs.get(row, column).and_then(Value::as_string)
}

fn flag(rs: &ResultSet, row: usize, column: &str) -> bool {
    rs.get(row, column).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_queries_are_single_statements() {
        for sql in [
            LIST_SCHEMAS_SQL,
            LIST_TABLES_SQL,
            DESCRIBE_TABLE_SQL,
            HEALTH_CHECK_SQL,
        ] {
            assert!(sqlgate_rdbc::classifier::is_single_statement(sql), "{sql}");
        }
    }

    #[test]
    fn test_identifier_validation() {
        assert_eq!(identifier("table", "Order Items").unwrap(), "Order Items");
        let err = identifier("table", "").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("table:"));
    }
}
