//! Configuration constants for the CRM loader
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

use tracing::warn;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on pooled Postgres connections. Batches are written one at a
/// time, so a small pool is enough.
pub const MAX_POOL_SIZE: u32 = 4;

// ============================================================================
// Batch Loader Configuration
// ============================================================================

pub const MAX_RETRIES: u32 = 5;

/// Timeout for individual database queries
///
/// Set to 3 minutes because multi-row INSERT statements for large batches can
/// take a while when the table has indexes or constraints to validate.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(180); // 3 minutes

/// Batch size used when neither `--batch-size` nor `DB_BATCH_SIZE` is usable
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Environment variable consulted for the batch size
pub const BATCH_SIZE_ENV: &str = "DB_BATCH_SIZE";

/// Maximum bind parameters in a single Postgres statement
pub const POSTGRES_MAX_BIND_PARAMS: usize = 65_535;

/// Maximum bind parameters in a single SQLite statement (SQLITE_MAX_VARIABLE_NUMBER)
pub const SQLITE_MAX_BIND_PARAMS: usize = 32_766;

// ============================================================================
// Chunker Configuration
// ============================================================================

/// Default number of data lines per chunk file
pub const DEFAULT_MAX_RECORDS_PER_CHUNK: usize = 50_000;

/// Name of the sync bookkeeping table
pub const SYNC_STATE_TABLE: &str = "SyncState";

/// Resolve the batch size from an optional raw value (usually the
/// `DB_BATCH_SIZE` environment variable).
///
/// Missing values use [`DEFAULT_BATCH_SIZE`]. Values that do not parse as a
/// positive integer also fall back to the default, with a warning.
pub fn resolve_batch_size(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_BATCH_SIZE;
    };

    match raw.trim().parse::<usize>() {
        Ok(size) if size > 0 => size,
        Ok(_) => {
            warn!(
                "Invalid {} value '{}': batch size must be positive. Defaulting to {}",
                BATCH_SIZE_ENV, raw, DEFAULT_BATCH_SIZE
            );
            DEFAULT_BATCH_SIZE
        }
        Err(e) => {
            warn!(
                "Invalid {} value '{}': {}. Defaulting to {}",
                BATCH_SIZE_ENV, raw, e, DEFAULT_BATCH_SIZE
            );
            DEFAULT_BATCH_SIZE
        }
    }
}
