//! High-level runner API for the CRM loader.
//!
//! Wraps schema resolution, CSV reading, conversion, connection setup and
//! batched loading behind a few entry points. This is the API the CLI uses.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::convert::{ConversionError, RowConverter, TypedRow};
use crate::db::ddl::{generate_ddl, generate_sync_state_ddl};
use crate::db::sync_state::SyncStateStore;
use crate::db::{self, Pool, quote_ident};
use crate::formats::{CsvSource, DelimitedConfig};
use crate::loader::{BatchLoader, BulkSink, SqlSink, SyncStateSink};
use crate::schema::{SchemaRegistry, TableSchema};
use crate::telemetry::{ProgressStats, TelemetryEvent};

pub use crate::chunker::SplitSummary;
pub use crate::config::{BATCH_SIZE_ENV, DEFAULT_MAX_RECORDS_PER_CHUNK, resolve_batch_size};
pub use crate::db::Dialect;
pub use crate::db::sync_state::SyncState;
pub use crate::loader::WriteMode;

/// Arguments for one CSV import
#[derive(Debug, Clone, Builder)]
pub struct ImportConfig {
    /// CSV file with a header row
    #[builder(setter(into))]
    pub input: PathBuf,
    /// Preset schema name (`contact`, ...) or path to a JSON schema file
    #[builder(setter(into))]
    pub schema: String,
    /// `postgres://...` or `sqlite:...`
    #[builder(setter(into))]
    pub database_url: String,
    /// Destination table, overriding the schema's table name
    #[builder(setter(into, strip_option), default)]
    pub table: Option<String>,
    /// Destination database schema (Postgres only)
    #[builder(setter(into, strip_option), default)]
    pub db_schema: Option<String>,
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    pub batch_size: usize,
    #[builder(default)]
    pub mode: WriteMode,
    /// Run `CREATE TABLE IF NOT EXISTS` before loading
    #[builder(default)]
    pub create_table: bool,
    /// Record progress in `SyncState` under this name
    #[builder(setter(into, strip_option), default)]
    pub sync_state: Option<String>,
    /// Skip records whose watermark is not newer than the stored sync state
    #[builder(default)]
    pub since_last_sync: bool,
    /// Write rejected records as JSON to this path
    #[builder(setter(into, strip_option), default)]
    pub reject_file: Option<PathBuf>,
    #[builder(default)]
    pub quiet: bool,
}

/// A record left out of the load because one or more fields failed conversion
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub line_number: u64,
    pub key: Option<String>,
    pub errors: Vec<ConversionError>,
}

/// Result of a completed import
#[derive(Debug)]
pub struct ImportResult {
    pub run_id: String,
    pub table: String,
    pub records_read: u64,
    pub records_rejected: u64,
    /// Records at or before the stored sync watermark
    pub records_skipped: u64,
    pub rows_attempted: u64,
    pub rows_committed: u64,
    pub batches: usize,
    pub rejections: Vec<Rejection>,
    pub stats: ProgressStats,
    pub duration: Duration,
}

/// Records split by conversion outcome
struct PreparedRecords {
    rows: Vec<TypedRow>,
    rejections: Vec<Rejection>,
    skipped: u64,
}

/// Convert every record; invalid ones become rejections, records at or before
/// `since` are skipped.
fn prepare_records(
    schema: &TableSchema,
    source: &CsvSource,
    since: Option<NaiveDateTime>,
    stats: &mut ProgressStats,
) -> PreparedRecords {
    let converter = RowConverter::new(schema);
    let mut prepared = PreparedRecords {
        rows: Vec::with_capacity(source.records.len()),
        rejections: Vec::new(),
        skipped: 0,
    };

    for record in &source.records {
        let converted = converter.convert(record);

        if !converted.is_valid() {
            let errors = converted
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(
                "Rejected record {} on line {}: {}",
                converted.key.as_deref().unwrap_or("<no key>"),
                converted.line_number,
                errors
            );
            stats.update(&TelemetryEvent::RecordRejected);
            prepared.rejections.push(Rejection {
                line_number: converted.line_number,
                key: converted.key,
                errors: converted.errors,
            });
            continue;
        }

        if let (Some(since), Some(watermark_column)) = (since, schema.watermark_column.as_deref())
            && let Some(watermark) = converted
                .row
                .get(schema, watermark_column)
                .and_then(|v| v.as_datetime())
            && watermark <= since
        {
            prepared.skipped += 1;
            continue;
        }

        prepared.rows.push(converted.row);
    }

    prepared
}

/// Check the CSV header against the schema. A missing required column is
/// fatal; missing optional columns load as NULL; unknown columns are ignored.
fn validate_headers(schema: &TableSchema, headers: &[String]) -> Result<()> {
    let missing_required: Vec<&str> = schema
        .columns
        .iter()
        .filter(|c| !c.nullable && !headers.iter().any(|h| h == &c.name))
        .map(|c| c.name.as_str())
        .collect();
    if !missing_required.is_empty() {
        anyhow::bail!(
            "CSV header is missing required column(s) for '{}': {}",
            schema.table,
            missing_required.join(", ")
        );
    }

    for column in schema.columns.iter().filter(|c| c.nullable) {
        if !headers.iter().any(|h| h == &column.name) {
            warn!("Column '{}' not in CSV header, loading NULL", column.name);
        }
    }

    let extra: Vec<&str> = headers
        .iter()
        .filter(|h| !h.is_empty() && schema.column(h).is_none())
        .map(String::as_str)
        .collect();
    if !extra.is_empty() {
        warn!("Ignoring CSV columns not in schema: {}", extra.join(", "));
    }

    Ok(())
}

fn resolve_schema(schema: &str, table: Option<&str>) -> Result<TableSchema> {
    let resolved = SchemaRegistry::default().resolve(schema)?;
    Ok(match table {
        Some(table) => resolved.with_table(table),
        None => resolved,
    })
}

fn progress_bar(quiet: bool, total_rows: u64) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(total_rows);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(
                "[{elapsed_precise}] Rows: [{bar:30.green/blue}] {human_pos}/{human_len} ({percent}%) | {per_sec}",
            )
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );
    Ok(bar)
}

async fn write_rejections(path: &Path, rejections: &[Rejection]) -> Result<()> {
    let json = serde_json::to_string_pretty(rejections)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write reject file {}", path.display()))?;
    info!(
        "Wrote {} rejected records to {}",
        rejections.len(),
        path.display()
    );
    Ok(())
}

/// Run a CSV import with the specified configuration
///
/// # Example
///
/// ```no_run
/// use crm_loader::runner::{ImportConfigBuilder, WriteMode, run_import};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = ImportConfigBuilder::default()
///     .input("exports/Contact.csv")
///     .schema("contact")
///     .database_url("postgres://loader@localhost/crm")
///     .mode(WriteMode::Upsert)
///     .sync_state("ContactSync")
///     .build()?;
///
/// let result = run_import(config).await?;
/// println!("Committed {} rows", result.rows_committed);
/// # Ok(())
/// # }
/// ```
pub async fn run_import(config: ImportConfig) -> Result<ImportResult> {
    let start = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    info!("Starting import run: {}", run_id);

    if config.since_last_sync && config.sync_state.is_none() {
        anyhow::bail!("--since-last-sync requires --sync-state NAME");
    }

    let schema = resolve_schema(&config.schema, config.table.as_deref())?;
    let loader = BatchLoader::new(config.batch_size)?;

    let source = CsvSource::open(&config.input, &DelimitedConfig::csv()).await?;
    validate_headers(&schema, &source.headers)?;
    info!(
        "Read {} records from {}",
        source.records.len(),
        config.input.display()
    );

    let pool = db::pool::connect(&config.database_url).await?;
    pool.execute_query("SELECT 1")
        .await
        .context("Failed to connect to the destination database")?;

    let table_spec = pool.qualified_table_name(config.db_schema.as_deref(), &schema.table);

    if config.create_table {
        info!("Creating table if missing: {}", table_spec);
        let ddl = generate_ddl(&table_spec, &schema, pool.dialect());
        pool.execute_query(&ddl)
            .await
            .with_context(|| format!("Failed to create table {}", table_spec))?;
    }

    let sync_store = config
        .sync_state
        .as_ref()
        .map(|_| SyncStateStore::new(pool.clone(), config.db_schema.as_deref()));

    let since = match (&sync_store, &config.sync_state) {
        (Some(store), Some(name)) if config.since_last_sync => {
            store.ensure_table().await?;
            let since = store
                .get(name)
                .await?
                .and_then(|state| state.last_system_modstamp);
            if let Some(since) = since {
                info!("Loading records modified after {} ('{}')", since, name);
            }
            since
        }
        _ => None,
    };

    let mut stats = ProgressStats::new();
    let prepared = prepare_records(&schema, &source, since, &mut stats);
    if prepared.skipped > 0 {
        info!(
            "Skipped {} records already covered by the last sync",
            prepared.skipped
        );
    }

    if let Some(path) = &config.reject_file {
        write_rejections(path, &prepared.rejections).await?;
    }

    let bar = progress_bar(config.quiet, prepared.rows.len() as u64)?;
    let loader = loader.with_progress(bar.clone());

    let sql_sink = SqlSink::new(pool.clone(), table_spec.clone(), config.mode);
    let mut sink: Box<dyn BulkSink> = match (sync_store, &config.sync_state) {
        (Some(store), Some(name)) => Box::new(SyncStateSink::new(sql_sink, store, name.clone())),
        _ => Box::new(sql_sink),
    };

    let summary = loader
        .load(&schema, &prepared.rows, sink.as_mut())
        .await
        .with_context(|| format!("Import into {} failed", table_spec))?;
    bar.finish_and_clear();

    stats.batches_committed = summary.stats.batches_committed;
    stats.rows_attempted = summary.stats.rows_attempted;
    stats.rows_committed = summary.stats.rows_committed;
    stats.batch_durations_ms = summary.stats.batch_durations_ms;

    info!(
        "Import {} complete: {} committed, {} rejected",
        run_id,
        summary.rows_committed,
        prepared.rejections.len()
    );

    Ok(ImportResult {
        run_id,
        table: table_spec,
        records_read: source.records.len() as u64,
        records_rejected: prepared.rejections.len() as u64,
        records_skipped: prepared.skipped,
        rows_attempted: summary.rows_attempted,
        rows_committed: summary.rows_committed,
        batches: summary.batches,
        rejections: prepared.rejections,
        stats,
        duration: start.elapsed(),
    })
}

/// Split a CSV file into chunks of at most `max_records` data lines
pub async fn run_split(
    input: &Path,
    max_records: usize,
    output_dir: Option<&Path>,
) -> Result<SplitSummary> {
    chunker::split_csv_file(input, max_records, output_dir).await
}

/// Render `CREATE TABLE` statements for a schema and, optionally, the
/// `SyncState` table
pub fn render_ddl(
    schema: &str,
    dialect: Dialect,
    table: Option<&str>,
    db_schema: Option<&str>,
    include_sync_state: bool,
) -> Result<String> {
    let schema = resolve_schema(schema, table)?;
    let qualify = |name: &str| match (dialect, db_schema) {
        (Dialect::Postgres, Some(s)) if !s.is_empty() => {
            format!("{}.{}", quote_ident(s), quote_ident(name))
        }
        _ => quote_ident(name),
    };

    let mut ddl = generate_ddl(&qualify(&schema.table), &schema, dialect);
    if include_sync_state {
        ddl.push_str("\n\n");
        ddl.push_str(&generate_sync_state_ddl(
            &qualify(crate::config::SYNC_STATE_TABLE),
            dialect,
        ));
    }
    Ok(ddl)
}

/// Read the stored state of a named sync
pub async fn show_sync_state(
    database_url: &str,
    state_name: &str,
    db_schema: Option<&str>,
) -> Result<Option<SyncState>> {
    let pool: Pool = db::pool::connect(database_url).await?;
    let store = SyncStateStore::new(pool, db_schema);
    store.ensure_table().await?;
    store.get(state_name).await
}
