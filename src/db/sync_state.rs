//! `SyncState` bookkeeping: the last record each named sync has committed.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::ddl::generate_sync_state_ddl;
use super::{Pool, SqlParam};
use crate::config::SYNC_STATE_TABLE;
use crate::convert::TypedValue;
use crate::schema::ColumnType;

/// One row of the `SyncState` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub state_name: String,
    pub last_record_id: Option<String>,
    pub last_system_modstamp: Option<NaiveDateTime>,
    pub last_updated: Option<NaiveDateTime>,
}

/// Reads and writes `SyncState` rows
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    pool: Pool,
    table_spec: String,
}

impl SyncStateStore {
    pub fn new(pool: Pool, db_schema: Option<&str>) -> Self {
        let table_spec = pool.qualified_table_name(db_schema, SYNC_STATE_TABLE);
        Self { pool, table_spec }
    }

    /// Create the table if it doesn't exist
    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = generate_sync_state_ddl(&self.table_spec, self.pool.dialect());
        self.pool
            .execute_query(&ddl)
            .await
            .context("Failed to create SyncState table")?;
        Ok(())
    }

    /// Look up the state for a sync, `None` when it has never run
    pub async fn get(&self, state_name: &str) -> Result<Option<SyncState>> {
        let sql = format!(
            "SELECT \"LastRecordId\", \"LastSystemModstamp\", \"LastUpdatedDateTime\" \
             FROM {} WHERE \"StateName\" = $1",
            self.table_spec
        );

        let row = self
            .pool
            .fetch_sync_state_row(&sql, state_name)
            .await
            .with_context(|| format!("Failed to read SyncState for '{}'", state_name))?;

        match row {
            Some((last_record_id, last_system_modstamp, last_updated)) => Ok(Some(SyncState {
                state_name: state_name.to_string(),
                last_record_id,
                last_system_modstamp,
                last_updated,
            })),
            None => {
                info!("No existing sync state found for '{}'", state_name);
                Ok(None)
            }
        }
    }

    /// Insert or overwrite the state for a sync
    pub async fn update(
        &self,
        state_name: &str,
        last_record_id: Option<&str>,
        last_system_modstamp: NaiveDateTime,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (\"StateName\", \"LastRecordId\", \"LastSystemModstamp\", \"LastUpdatedDateTime\") \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (\"StateName\") DO UPDATE SET \
             \"LastRecordId\" = excluded.\"LastRecordId\", \
             \"LastSystemModstamp\" = excluded.\"LastSystemModstamp\", \
             \"LastUpdatedDateTime\" = excluded.\"LastUpdatedDateTime\"",
            self.table_spec
        );

        let name = TypedValue::String(state_name.to_string());
        let record_id = last_record_id
            .map(|id| TypedValue::String(id.to_string()))
            .unwrap_or(TypedValue::Null);
        let modstamp = TypedValue::DateTime(last_system_modstamp);
        let now = TypedValue::DateTime(Utc::now().naive_utc());

        let params = [
            SqlParam::new(ColumnType::String, &name),
            SqlParam::new(ColumnType::String, &record_id),
            SqlParam::new(ColumnType::DateTime, &modstamp),
            SqlParam::new(ColumnType::DateTime, &now),
        ];

        self.pool
            .execute_with_params(&sql, &params)
            .await
            .with_context(|| format!("Failed to update SyncState for '{}'", state_name))?;

        debug!(
            state_name,
            last_record_id = last_record_id.unwrap_or_default(),
            %last_system_modstamp,
            "SyncState updated"
        );
        Ok(())
    }
}
