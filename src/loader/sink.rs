use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::BulkSink;
use crate::config::{MAX_RETRIES, QUERY_TIMEOUT};
use crate::convert::{TypedRow, TypedValue};
use crate::db::{Pool, SqlParam, quote_ident};
use crate::schema::TableSchema;

/// Base delay for retry backoff; attempt `n` waits `RETRY_BASE_DELAY_MS * 2^n`
const RETRY_BASE_DELAY_MS: u64 = 100;

/// How rows are written to the destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Plain `INSERT`; a key conflict fails the batch
    #[default]
    Insert,
    /// Insert new keys, update existing ones. With a watermark column the
    /// update only applies when the incoming row is newer.
    Upsert,
}

impl WriteMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(WriteMode::Insert),
            "upsert" | "merge" => Ok(WriteMode::Upsert),
            _ => Err(anyhow!(
                "Unsupported write mode: {}. Supported modes: insert, upsert",
                s
            )),
        }
    }
}

/// [`BulkSink`] writing to a table through the database pool, one multi-row
/// statement per batch
pub struct SqlSink {
    pool: Pool,
    table_spec: String,
    mode: WriteMode,
}

impl SqlSink {
    /// `table_spec` is the quoted, possibly schema-qualified table name
    pub fn new(pool: Pool, table_spec: impl Into<String>, mode: WriteMode) -> Self {
        Self {
            pool,
            table_spec: table_spec.into(),
            mode,
        }
    }

    /// Build the statement for `row_count` rows:
    /// `INSERT INTO t ("a", "b") VALUES ($1, $2), ($3, $4) [ON CONFLICT ...]`
    pub fn build_insert_sql(&self, schema: &TableSchema, row_count: usize) -> Result<String> {
        let num_columns = schema.columns.len();
        let column_list = schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut value_groups = Vec::with_capacity(row_count);
        let mut param_idx = 1;
        for _ in 0..row_count {
            let placeholders: Vec<String> = (0..num_columns)
                .map(|_| {
                    let placeholder = format!("${}", param_idx);
                    param_idx += 1;
                    placeholder
                })
                .collect();
            value_groups.push(format!("({})", placeholders.join(", ")));
        }

        let (target, conflict_clause) = match self.mode {
            WriteMode::Insert => (self.table_spec.clone(), String::new()),
            WriteMode::Upsert => (
                format!("{} AS target", self.table_spec),
                upsert_clause(schema)?,
            ),
        };

        Ok(format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            target,
            column_list,
            value_groups.join(", "),
            conflict_clause
        ))
    }

    fn check_bind_limit(&self, schema: &TableSchema, row_count: usize) -> Result<()> {
        let max_params = self.pool.dialect().max_bind_params();
        let needed = row_count * schema.columns.len();
        if needed > max_params {
            anyhow::bail!(
                "Batch of {} rows x {} columns needs {} bind parameters, over the limit of {}.\n\
                 Use a batch size of at most {}.",
                row_count,
                schema.columns.len(),
                needed,
                max_params,
                max_params / schema.columns.len().max(1)
            );
        }
        Ok(())
    }

    /// Execute a batch statement, retrying transient errors with exponential backoff
    async fn execute_with_retry(&self, sql: &str, params: &[SqlParam<'_>]) -> Result<u64> {
        let mut attempt = 0;
        loop {
            let result =
                tokio::time::timeout(QUERY_TIMEOUT, self.pool.execute_with_params(sql, params))
                    .await;
            let last_attempt = attempt + 1 >= MAX_RETRIES;

            match result {
                Ok(Ok(rows_affected)) => return Ok(rows_affected),
                Ok(Err(e)) => {
                    if !is_retryable_error(&e) {
                        return Err(e).context("Failed to execute batch insert");
                    }
                    if last_attempt {
                        return Err(e).context(format!(
                            "Failed to execute batch insert after {} attempts",
                            attempt + 1
                        ));
                    }
                    warn!(attempt = attempt + 1, error = %e, "transient database error, retrying");
                }
                Err(_) => {
                    if last_attempt {
                        return Err(anyhow!(
                            "Query execution timed out after {} seconds",
                            QUERY_TIMEOUT.as_secs()
                        ));
                    }
                    warn!(attempt = attempt + 1, "batch insert timed out, retrying");
                }
            }

            let delay_ms = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
            tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl BulkSink for SqlSink {
    async fn prepare(&mut self, schema: &TableSchema, batch_size: usize) -> Result<()> {
        if self.mode == WriteMode::Upsert && schema.key_column.is_none() {
            anyhow::bail!(
                "Upsert into {} requires a key column, but schema '{}' has none",
                self.table_spec,
                schema.table
            );
        }
        self.check_bind_limit(schema, batch_size)
    }

    async fn write_batch(&mut self, schema: &TableSchema, rows: &[TypedRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.check_bind_limit(schema, rows.len())?;
        if self.mode == WriteMode::Upsert {
            check_unique_keys(schema, rows)?;
        }

        let sql = self.build_insert_sql(schema, rows.len())?;

        let mut params = Vec::with_capacity(rows.len() * schema.columns.len());
        for row in rows {
            if row.values.len() != schema.columns.len() {
                anyhow::bail!(
                    "Row has {} values but table '{}' has {} columns",
                    row.values.len(),
                    schema.table,
                    schema.columns.len()
                );
            }
            for (column, value) in schema.columns.iter().zip(&row.values) {
                params.push(SqlParam::new(column.column_type, value));
            }
        }

        match self.execute_with_retry(&sql, &params).await {
            Ok(rows_affected) => {
                debug!(rows = rows.len(), rows_affected, table = %self.table_spec, "batch written");
                Ok(rows_affected)
            }
            Err(e) => {
                // Root cause is the database's own message
                let db_error = e.root_cause().to_string();
                let first_record_sample = rows
                    .first()
                    .map(preview_row)
                    .unwrap_or_else(|| "<empty>".to_string());

                Err(e).context(format!(
                    "Database error: {}\n\
                     \n\
                     Batch context:\n\
                     - Table: {}\n\
                     - Batch size: {} records\n\
                     - First record sample: {}",
                    db_error,
                    self.table_spec,
                    rows.len(),
                    first_record_sample
                ))
            }
        }
    }
}

/// `ON CONFLICT (key) DO UPDATE SET ...` with the optional "only if newer" guard
fn upsert_clause(schema: &TableSchema) -> Result<String> {
    let key = schema
        .key_column
        .as_deref()
        .context("Upsert requires a key column")?;

    let assignments: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| c.name != key)
        .map(|c| {
            let col = quote_ident(&c.name);
            format!("{} = excluded.{}", col, col)
        })
        .collect();

    if assignments.is_empty() {
        return Ok(format!(" ON CONFLICT ({}) DO NOTHING", quote_ident(key)));
    }

    let mut clause = format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        quote_ident(key),
        assignments.join(", ")
    );
    if let Some(watermark) = &schema.watermark_column {
        let col = quote_ident(watermark);
        clause.push_str(&format!(" WHERE target.{} < excluded.{}", col, col));
    }
    Ok(clause)
}

/// Postgres refuses to update the same row twice in one statement, so a
/// batch with a repeated key is rejected up front on every backend.
fn check_unique_keys(schema: &TableSchema, rows: &[TypedRow]) -> Result<()> {
    let Some(key) = schema.key_column.as_deref() else {
        return Ok(());
    };
    let mut seen = HashSet::new();
    for row in rows {
        let k = match row.get(schema, key) {
            Some(TypedValue::String(s)) => s.clone(),
            Some(TypedValue::Int(i)) => i.to_string(),
            _ => continue,
        };
        if !seen.insert(k.clone()) {
            anyhow::bail!("Duplicate key '{}' within one upsert batch", k);
        }
    }
    Ok(())
}

fn preview_row(row: &TypedRow) -> String {
    let preview: Vec<String> = row
        .values
        .iter()
        .take(3)
        .map(|v| {
            let text = match v {
                TypedValue::Null => "NULL".to_string(),
                TypedValue::String(s) => s.clone(),
                TypedValue::Bool(b) => b.to_string(),
                TypedValue::Double(d) => d.to_string(),
                TypedValue::Int(i) => i.to_string(),
                TypedValue::DateTime(dt) => dt.to_string(),
            };
            if text.chars().count() > 20 {
                format!("{}...", text.chars().take(20).collect::<String>())
            } else {
                text
            }
        })
        .collect();
    format!(
        "[{}{}]",
        preview.join(", "),
        if row.values.len() > 3 { ", ..." } else { "" }
    )
}

/// Check if error is retriable (transient errors that may resolve with retry)
fn is_retryable_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
            // serialization failure, deadlock, admin shutdown
            Some("40001" | "40P01" | "57P01") => true,
            // SQLITE_BUSY, SQLITE_LOCKED
            Some("5" | "6") => true,
            Some(code) => code.starts_with("08"),
            None => false,
        },
        _ => {
            let error_msg = error.to_string();
            error_msg.contains("Connection reset") || error_msg.contains("broken pipe")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_datetime;
    use crate::db::ddl::generate_ddl;
    use crate::schema::{ColumnSpec, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(
            "Account",
            Some("Id"),
            Some("SystemModstamp"),
            vec![
                ColumnSpec::required("Id", ColumnType::String),
                ColumnSpec::optional("Name", ColumnType::String),
                ColumnSpec::optional("IsDeleted", ColumnType::Bool),
                ColumnSpec::optional("Score", ColumnType::Double),
                ColumnSpec::optional("Employees", ColumnType::Int),
                ColumnSpec::optional("SystemModstamp", ColumnType::DateTime),
            ],
        )
        .unwrap()
    }

    fn row(id: &str, name: Option<&str>, modstamp: &str) -> TypedRow {
        TypedRow {
            values: vec![
                TypedValue::String(id.to_string()),
                name.map(|n| TypedValue::String(n.to_string()))
                    .unwrap_or(TypedValue::Null),
                TypedValue::Bool(false),
                TypedValue::Null,
                TypedValue::Int(12),
                TypedValue::DateTime(parse_datetime(modstamp).unwrap()),
            ],
        }
    }

    async fn sink_with_table(mode: WriteMode) -> SqlSink {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let table_spec = pool.qualified_table_name(None, "Account");
        let ddl = generate_ddl(&table_spec, &schema(), pool.dialect());
        pool.execute_query(&ddl).await.unwrap();
        SqlSink::new(pool, table_spec, mode)
    }

    async fn name_of(sink: &SqlSink, id: &str) -> Option<String> {
        let (name,): (Option<String>,) =
            sqlx::query_as("SELECT \"Name\" FROM \"Account\" WHERE \"Id\" = ?")
                .bind(id)
                .fetch_one(sink.pool.as_sqlite())
                .await
                .unwrap();
        name
    }

    #[test]
    fn test_write_mode_parse() {
        assert_eq!(WriteMode::parse("insert").unwrap(), WriteMode::Insert);
        assert_eq!(WriteMode::parse("UPSERT").unwrap(), WriteMode::Upsert);
        assert_eq!(WriteMode::parse("merge").unwrap(), WriteMode::Upsert);
        assert!(WriteMode::parse("replace").is_err());
    }

    #[tokio::test]
    async fn test_insert_sql_shape() {
        let sink = sink_with_table(WriteMode::Insert).await;
        let sql = sink.build_insert_sql(&schema(), 2).unwrap();
        assert!(sql.starts_with(
            "INSERT INTO \"Account\" (\"Id\", \"Name\", \"IsDeleted\", \"Score\", \"Employees\", \"SystemModstamp\") VALUES"
        ));
        assert!(sql.ends_with("($7, $8, $9, $10, $11, $12)"));
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[tokio::test]
    async fn test_upsert_sql_has_watermark_guard() {
        let sink = sink_with_table(WriteMode::Upsert).await;
        let sql = sink.build_insert_sql(&schema(), 1).unwrap();
        assert!(sql.starts_with("INSERT INTO \"Account\" AS target"));
        assert!(sql.contains("ON CONFLICT (\"Id\") DO UPDATE SET \"Name\" = excluded.\"Name\""));
        assert!(!sql.contains("\"Id\" = excluded.\"Id\""));
        assert!(sql.ends_with(
            "WHERE target.\"SystemModstamp\" < excluded.\"SystemModstamp\""
        ));
    }

    #[tokio::test]
    async fn test_nulls_are_stored_as_sql_null() {
        let mut sink = sink_with_table(WriteMode::Insert).await;
        let rows = vec![
            row("001A", None, "2024-01-01 00:00:00"),
            row("001B", Some("Acme"), "2024-01-02 00:00:00"),
        ];

        let committed = sink.write_batch(&schema(), &rows).await.unwrap();
        assert_eq!(committed, 2);

        let (null_names, null_scores): (i64, i64) = sqlx::query_as(
            "SELECT \
               SUM(CASE WHEN \"Name\" IS NULL THEN 1 ELSE 0 END), \
               SUM(CASE WHEN \"Score\" IS NULL THEN 1 ELSE 0 END) \
             FROM \"Account\"",
        )
        .fetch_one(sink.pool.as_sqlite())
        .await
        .unwrap();
        assert_eq!(null_names, 1);
        assert_eq!(null_scores, 2);
        assert_eq!(name_of(&sink, "001B").await.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_insert_duplicate_key_is_fatal() {
        let mut sink = sink_with_table(WriteMode::Insert).await;
        let batch = vec![row("001A", Some("one"), "2024-01-01 00:00:00")];
        sink.write_batch(&schema(), &batch).await.unwrap();

        let err = sink.write_batch(&schema(), &batch).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Batch context"));
        assert!(message.contains("First record sample: [001A, one, false]"));
    }

    #[tokio::test]
    async fn test_upsert_only_overwrites_older_rows() {
        let mut sink = sink_with_table(WriteMode::Upsert).await;
        let schema = schema();
        sink.prepare(&schema, 10).await.unwrap();

        sink.write_batch(&schema, &[row("001A", Some("current"), "2024-02-01 00:00:00")])
            .await
            .unwrap();

        // Stale incoming row is ignored
        let committed = sink
            .write_batch(&schema, &[row("001A", Some("stale"), "2024-01-01 00:00:00")])
            .await
            .unwrap();
        assert_eq!(committed, 0);
        assert_eq!(name_of(&sink, "001A").await.as_deref(), Some("current"));

        // Newer incoming row wins, new keys are inserted
        let committed = sink
            .write_batch(
                &schema,
                &[
                    row("001A", Some("newer"), "2024-03-01 00:00:00"),
                    row("001B", Some("fresh"), "2024-03-01 00:00:00"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(committed, 2);
        assert_eq!(name_of(&sink, "001A").await.as_deref(), Some("newer"));
        assert_eq!(sink.pool.count_rows("\"Account\"").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_rejects_duplicate_keys_in_batch() {
        let mut sink = sink_with_table(WriteMode::Upsert).await;
        let rows = vec![
            row("001A", Some("a"), "2024-01-01 00:00:00"),
            row("001A", Some("b"), "2024-01-02 00:00:00"),
        ];
        let err = sink.write_batch(&schema(), &rows).await.unwrap_err();
        assert!(err.to_string().contains("Duplicate key '001A'"));
    }

    #[tokio::test]
    async fn test_upsert_requires_key_column() {
        let mut sink = sink_with_table(WriteMode::Upsert).await;
        let mut keyless = schema();
        keyless.key_column = None;
        assert!(sink.prepare(&keyless, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_parameter_limit() {
        let mut sink = sink_with_table(WriteMode::Insert).await;
        // 6 columns: 5461 rows fit in 32766 parameters, 5462 do not
        assert!(sink.prepare(&schema(), 5461).await.is_ok());
        let err = sink.prepare(&schema(), 5462).await.unwrap_err();
        assert!(err.to_string().contains("at most 5461"));
    }

    #[test]
    fn test_preview_row_truncates() {
        let row = TypedRow {
            values: vec![
                TypedValue::String("x".repeat(30)),
                TypedValue::Null,
                TypedValue::Double(1.5),
                TypedValue::Int(4),
            ],
        };
        assert_eq!(
            preview_row(&row),
            format!("[{}..., NULL, 1.5, ...]", "x".repeat(20))
        );
    }
}
