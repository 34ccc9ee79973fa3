//! Database layer - connection pooling, typed binds, DDL and sync bookkeeping

pub mod ddl;
pub mod params;
pub mod pool;
pub mod sync_state;

pub use params::SqlParam;
pub use pool::{Pool, quote_ident};

use anyhow::Result;

use crate::config::{POSTGRES_MAX_BIND_PARAMS, SQLITE_MAX_BIND_PARAMS};

/// SQL dialect of the destination database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Parse dialect from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            _ => Err(anyhow::anyhow!(
                "Unsupported dialect: {}. Supported dialects: postgres, sqlite",
                s
            )),
        }
    }

    /// Detect the dialect from a connection URL
    pub fn from_url(url: &str) -> Result<Self> {
        let lower = url.trim().to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if lower.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(anyhow::anyhow!(
                "Unsupported database URL. Expected postgres://... or sqlite:..."
            ))
        }
    }

    /// Maximum number of bind parameters in one statement
    pub fn max_bind_params(&self) -> usize {
        match self {
            Dialect::Postgres => POSTGRES_MAX_BIND_PARAMS,
            Dialect::Sqlite => SQLITE_MAX_BIND_PARAMS,
        }
    }
}
