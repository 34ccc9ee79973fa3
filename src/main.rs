use clap::{Parser, Subcommand};
use crm_loader::runner::{
    BATCH_SIZE_ENV, DEFAULT_MAX_RECORDS_PER_CHUNK, Dialect, ImportConfigBuilder, WriteMode,
    render_ddl, resolve_batch_size, run_import, run_split, show_sync_state,
};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Clone)]
#[command(about = "Load CRM CSV exports into a relational database")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Convert a CSV export and bulk load it into a table
    Import {
        /// Path to the CSV file (with header row)
        #[arg(short, long)]
        input: PathBuf,

        /// Schema preset (contact, content_document_link, content_version) or JSON schema file
        #[arg(short, long)]
        schema: String,

        /// Database URL (postgres://... or sqlite:...)
        #[arg(short, long, env = "SQL_CONNECTION_STRING", hide_env_values = true)]
        database_url: String,

        /// Target table name (defaults to the schema's table)
        #[arg(short, long)]
        table: Option<String>,

        /// Database schema of the target table (Postgres only)
        #[arg(long)]
        db_schema: Option<String>,

        /// Rows per insert batch (falls back to DB_BATCH_SIZE, then 500)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Write mode (insert, upsert)
        #[arg(short, long, default_value = "insert")]
        mode: String,

        /// Create table if it doesn't exist
        #[arg(long)]
        create_table: bool,

        /// Record progress in the SyncState table under this name
        #[arg(long)]
        sync_state: Option<String>,

        /// Only load records newer than the stored sync state
        #[arg(long)]
        since_last_sync: bool,

        /// Write rejected records to this JSON file
        #[arg(long)]
        reject_file: Option<PathBuf>,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
    /// Split a CSV file into numbered chunk files sharing its header
    Split {
        /// Path to the CSV file to split
        #[arg(short, long)]
        input: PathBuf,

        /// Maximum data lines per chunk file
        #[arg(short, long, default_value_t = DEFAULT_MAX_RECORDS_PER_CHUNK)]
        max_records: usize,

        /// Output directory (default: <name>_chunks next to the input)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Print CREATE TABLE statements for a schema
    Ddl {
        /// Schema preset or JSON schema file
        #[arg(short, long)]
        schema: String,

        /// SQL dialect (postgres, sqlite)
        #[arg(short, long, default_value = "postgres")]
        dialect: String,

        /// Table name override
        #[arg(short, long)]
        table: Option<String>,

        /// Database schema to qualify table names with (Postgres only)
        #[arg(long)]
        db_schema: Option<String>,

        /// Also print the SyncState table
        #[arg(long)]
        sync_state: bool,
    },
    /// Show the stored state of a named sync
    SyncState {
        /// Database URL (postgres://... or sqlite:...)
        #[arg(short, long, env = "SQL_CONNECTION_STRING", hide_env_values = true)]
        database_url: String,

        /// Sync name, e.g. ContactSync
        #[arg(short, long)]
        name: String,

        /// Database schema of the SyncState table (Postgres only)
        #[arg(long)]
        db_schema: Option<String>,
    },
}

fn init_tracing(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("crm_loader=warn,sqlx=off")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("crm_loader=info,sqlx=off"))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Import {
            input,
            schema,
            database_url,
            table,
            db_schema,
            batch_size,
            mode,
            create_table,
            sync_state,
            since_last_sync,
            reject_file,
            quiet,
        } => {
            init_tracing(quiet);

            let batch_size = match batch_size {
                Some(size) => size,
                None => resolve_batch_size(std::env::var(BATCH_SIZE_ENV).ok().as_deref()),
            };

            if !quiet {
                println!("CRM Data Loader");
                println!("===============");
                println!("Input: {}", input.display());
                println!("Schema: {}", schema);
                println!("Batch size: {}", batch_size);
                println!("Mode: {}", mode);
                println!();
            }

            let mut builder = ImportConfigBuilder::default();
            builder
                .input(input)
                .schema(schema)
                .database_url(database_url)
                .batch_size(batch_size)
                .mode(WriteMode::parse(&mode)?)
                .create_table(create_table)
                .since_last_sync(since_last_sync)
                .quiet(quiet);
            if let Some(table) = table {
                builder.table(table);
            }
            if let Some(db_schema) = db_schema {
                builder.db_schema(db_schema);
            }
            if let Some(sync_state) = sync_state {
                builder.sync_state(sync_state);
            }
            if let Some(reject_file) = &reject_file {
                builder.reject_file(reject_file.clone());
            }

            let result = run_import(builder.build()?).await?;

            println!();
            println!("Import Summary");
            println!("==============");
            println!("Run ID: {}", result.run_id);
            println!("Table: {}", result.table);
            println!("Records read: {}", result.records_read);
            println!("Records rejected: {}", result.records_rejected);
            if result.records_skipped > 0 {
                println!("Records skipped (already synced): {}", result.records_skipped);
            }
            println!("Rows attempted: {}", result.rows_attempted);
            println!("Rows committed: {}", result.rows_committed);
            println!("Batches: {}", result.batches);
            println!("Duration: {:.2}s", result.duration.as_secs_f64());
            if result.duration.as_secs_f64() > 0.0 {
                println!(
                    "Throughput: {:.2} rows/sec",
                    result.rows_committed as f64 / result.duration.as_secs_f64()
                );
            }

            if !result.rejections.is_empty() {
                println!();
                println!("Rejected records:");
                for rejection in result.rejections.iter().take(10) {
                    let errors: Vec<String> =
                        rejection.errors.iter().map(|e| e.to_string()).collect();
                    println!(
                        "  line {} ({}): {}",
                        rejection.line_number,
                        rejection.key.as_deref().unwrap_or("<no key>"),
                        errors.join("; ")
                    );
                }
                if result.rejections.len() > 10 {
                    println!("  ... and {} more", result.rejections.len() - 10);
                }
                if let Some(path) = reject_file {
                    println!("Full list written to {}", path.display());
                }
            }
        }
        Command::Split {
            input,
            max_records,
            output_dir,
        } => {
            init_tracing(false);
            let summary = run_split(&input, max_records, output_dir.as_deref()).await?;

            println!();
            println!("Split Summary");
            println!("=============");
            println!("Data lines: {}", summary.data_lines);
            println!("Files written: {}", summary.files.len());
            if !summary.files.is_empty() {
                println!("Output directory: {}", summary.output_dir.display());
            }
        }
        Command::Ddl {
            schema,
            dialect,
            table,
            db_schema,
            sync_state,
        } => {
            let ddl = render_ddl(
                &schema,
                Dialect::parse(&dialect)?,
                table.as_deref(),
                db_schema.as_deref(),
                sync_state,
            )?;
            println!("{}", ddl);
        }
        Command::SyncState {
            database_url,
            name,
            db_schema,
        } => {
            init_tracing(true);
            match show_sync_state(&database_url, &name, db_schema.as_deref()).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("No sync state recorded for '{}'", name),
            }
        }
    }
    Ok(())
}
