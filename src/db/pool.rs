//! Connection pooling for the destination database.
//!
//! Postgres connections are managed through bb8 on top of the sqlx Postgres
//! driver; SQLite uses sqlx's own pool.
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use derive_builder::Builder;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::Dialect;
use super::params::{SqlParam, bind_postgres, bind_sqlite};
use crate::config::{CONNECT_TIMEOUT, MAX_POOL_SIZE, PING_TIMEOUT};

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    Sqlite(sqlx::SqlitePool),
}

/// Row shape of a `SyncState` lookup: (LastRecordId, LastSystemModstamp, LastUpdatedDateTime)
pub type SyncStateRow = (Option<String>, Option<NaiveDateTime>, Option<NaiveDateTime>);

#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

#[derive(Builder)]
pub struct PoolArgs {
    /// `postgres://...` or `sqlite:...` connection URL
    #[builder(setter(into))]
    database_url: String,
    #[builder(default = "0")]
    min_idle: u32,
    #[builder(default = "MAX_POOL_SIZE")]
    max_pool_size: u32,
}

pub async fn pool(args: PoolArgs) -> Result<Pool> {
    let PoolArgs {
        database_url,
        min_idle,
        max_pool_size,
    } = args;

    match Dialect::from_url(&database_url)? {
        Dialect::Postgres => {
            let connect_options = PgConnectOptions::from_str(&database_url)
                .context("Invalid Postgres connection string")?;
            info!(
                host = connect_options.get_host(),
                database = connect_options.get_database().unwrap_or_default(),
                "connecting to postgres"
            );

            let bb8_pool = bb8::Builder::new()
                .min_idle(min_idle)
                .max_size(max_pool_size)
                .max_lifetime(Duration::from_secs(60 * 55))
                .connection_timeout(CONNECT_TIMEOUT)
                .build(ConnectionManager::new(connect_options))
                .await
                .context("Failed to create connection pool")?;

            Ok(Pool {
                inner: PoolInner::Postgres(bb8_pool),
            })
        }
        Dialect::Sqlite => {
            let connect_options = SqliteConnectOptions::from_str(&database_url)
                .context("Invalid SQLite connection string")?
                .create_if_missing(true);
            info!(url = %database_url, "connecting to sqlite");

            // A single connection: SQLite has one writer, and in-memory
            // databases are private to their connection.
            let sqlite_pool = SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .acquire_timeout(CONNECT_TIMEOUT)
                .connect_with(connect_options)
                .await
                .context("Failed to open SQLite database")?;

            Ok(Pool {
                inner: PoolInner::Sqlite(sqlite_pool),
            })
        }
    }
}

/// Connect using only a URL and default pool sizing
pub async fn connect(database_url: &str) -> Result<Pool> {
    let args = PoolArgsBuilder::default()
        .database_url(database_url)
        .build()?;
    pool(args).await
}

impl Pool {
    /// Create an in-memory SQLite pool
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self> {
        connect("sqlite::memory:").await
    }

    pub fn dialect(&self) -> Dialect {
        match &self.inner {
            PoolInner::Postgres(_) => Dialect::Postgres,
            PoolInner::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Quoted, optionally schema-qualified table name. SQLite has no schemas,
    /// so the schema part is dropped there.
    pub fn qualified_table_name(&self, schema: Option<&str>, table: &str) -> String {
        match (self.dialect(), schema) {
            (Dialect::Postgres, Some(schema)) if !schema.is_empty() => {
                format!("{}.{}", quote_ident(schema), quote_ident(table))
            }
            _ => quote_ident(table),
        }
    }

    /// Execute a statement without parameters (DDL like CREATE TABLE)
    pub async fn execute_query(&self, sql: &str) -> Result<u64, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(map_run_error)?;
                let result = sqlx::query(sql).execute(&mut *conn).await?;
                Ok(result.rows_affected())
            }
            PoolInner::Sqlite(pool) => {
                let result = sqlx::query(sql).execute(pool).await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Execute a statement with typed parameters written in Postgres `$n`
    /// style. Returns the number of rows affected.
    pub async fn execute_with_params(
        &self,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> Result<u64, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(map_run_error)?;
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let result = query.execute(&mut *conn).await?;
                Ok(result.rows_affected())
            }
            PoolInner::Sqlite(pool) => {
                let sqlite_sql = convert_to_sqlite_placeholders(sql);
                let mut query = sqlx::query(&sqlite_sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let result = query.execute(pool).await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Fetch at most one `SyncState` row with a single text bind parameter
    pub async fn fetch_sync_state_row(
        &self,
        sql: &str,
        bind_value: &str,
    ) -> Result<Option<SyncStateRow>, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(map_run_error)?;
                sqlx::query_as::<_, SyncStateRow>(sql)
                    .bind(bind_value)
                    .fetch_optional(&mut *conn)
                    .await
            }
            PoolInner::Sqlite(pool) => {
                let sqlite_sql = convert_to_sqlite_placeholders(sql);
                sqlx::query_as::<_, SyncStateRow>(&sqlite_sql)
                    .bind(bind_value)
                    .fetch_optional(pool)
                    .await
            }
        }
    }

    /// Count rows in a table
    #[cfg(test)]
    pub async fn count_rows(&self, table_spec: &str) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_spec);
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(map_run_error)?;
                let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;
                Ok(count)
            }
            PoolInner::Sqlite(pool) => {
                let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(pool).await?;
                Ok(count)
            }
        }
    }

    /// The underlying SQLite pool, for ad-hoc queries in tests
    #[cfg(test)]
    pub fn as_sqlite(&self) -> &sqlx::SqlitePool {
        match &self.inner {
            PoolInner::Sqlite(pool) => pool,
            PoolInner::Postgres(_) => panic!("not a SQLite pool"),
        }
    }
}

fn map_run_error(e: bb8::RunError<sqlx::Error>) -> sqlx::Error {
    match e {
        bb8::RunError::User(e) => e,
        bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
    }
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
///
/// Parameters must appear in the SQL in bind order, which is how every
/// statement in this crate is generated.
pub(crate) fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}

// bb8 adapter for `PgConnection`
pub struct ConnectionManager {
    connect_options: PgConnectOptions,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connect options.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self { connect_options }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::Connection::ping(conn))
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}
