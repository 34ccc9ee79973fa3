use super::{Dialect, quote_ident};
use crate::schema::{ColumnType, TableSchema};

/// Returns the SQL type name used for a column type
pub fn sql_type(column_type: ColumnType, dialect: Dialect) -> &'static str {
    match (dialect, column_type) {
        (Dialect::Postgres, ColumnType::String) => "TEXT",
        (Dialect::Postgres, ColumnType::Bool) => "BOOLEAN",
        (Dialect::Postgres, ColumnType::Double) => "DOUBLE PRECISION",
        (Dialect::Postgres, ColumnType::Int) => "INTEGER",
        (Dialect::Postgres, ColumnType::DateTime) => "TIMESTAMP",
        (Dialect::Sqlite, ColumnType::String) => "TEXT",
        (Dialect::Sqlite, ColumnType::Bool) => "BOOLEAN",
        (Dialect::Sqlite, ColumnType::Double) => "REAL",
        (Dialect::Sqlite, ColumnType::Int) => "INTEGER",
        (Dialect::Sqlite, ColumnType::DateTime) => "DATETIME",
    }
}

/// Generate a `CREATE TABLE IF NOT EXISTS` statement for a destination table.
///
/// `table_spec` is the already quoted (and possibly schema-qualified) name.
/// The key column, when the schema has one, becomes the primary key so that
/// upserts have a conflict target.
pub fn generate_ddl(table_spec: &str, schema: &TableSchema, dialect: Dialect) -> String {
    let mut ddl = format!("CREATE TABLE IF NOT EXISTS {} (\n", table_spec);

    let mut column_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|col| {
            let nullable_clause = if col.nullable { "" } else { " NOT NULL" };
            format!(
                "  {} {}{}",
                quote_ident(&col.name),
                sql_type(col.column_type, dialect),
                nullable_clause
            )
        })
        .collect();

    if let Some(key) = &schema.key_column {
        column_defs.push(format!("  PRIMARY KEY ({})", quote_ident(key)));
    }

    ddl.push_str(&column_defs.join(",\n"));
    ddl.push_str("\n);");

    ddl
}

/// Generate the DDL for the sync bookkeeping table
pub fn generate_sync_state_ddl(table_spec: &str, dialect: Dialect) -> String {
    let timestamp = sql_type(ColumnType::DateTime, dialect);
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  \
         \"StateName\" TEXT NOT NULL,\n  \
         \"LastRecordId\" TEXT,\n  \
         \"LastSystemModstamp\" {ts},\n  \
         \"LastUpdatedDateTime\" {ts},\n  \
         PRIMARY KEY (\"StateName\")\n);",
        table_spec,
        ts = timestamp
    )
}
