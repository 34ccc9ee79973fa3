use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{info, warn};

use super::BulkSink;
use crate::convert::TypedRow;
use crate::db::sync_state::SyncStateStore;
use crate::schema::TableSchema;

/// Wraps a sink and records sync progress in `SyncState` after every
/// committed batch: the batch's newest watermark and the key of that row.
pub struct SyncStateSink<S> {
    inner: S,
    store: SyncStateStore,
    state_name: String,
    recorded: Option<NaiveDateTime>,
}

impl<S: BulkSink> SyncStateSink<S> {
    pub fn new(inner: S, store: SyncStateStore, state_name: impl Into<String>) -> Self {
        Self {
            inner,
            store,
            state_name: state_name.into(),
            recorded: None,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Row with the greatest watermark in a batch, as (watermark, key)
fn newest_in_batch<'a>(
    schema: &TableSchema,
    rows: &'a [TypedRow],
    watermark_column: &str,
) -> Option<(NaiveDateTime, Option<&'a str>)> {
    let mut newest: Option<(NaiveDateTime, Option<&'a str>)> = None;
    for row in rows {
        let Some(watermark) = row
            .get(schema, watermark_column)
            .and_then(|v| v.as_datetime())
        else {
            continue;
        };
        if newest.is_none_or(|(current, _)| watermark > current) {
            let key = schema
                .key_column
                .as_deref()
                .and_then(|k| row.get(schema, k))
                .and_then(|v| v.as_str());
            newest = Some((watermark, key));
        }
    }
    newest
}

#[async_trait]
impl<S: BulkSink> BulkSink for SyncStateSink<S> {
    async fn prepare(&mut self, schema: &TableSchema, batch_size: usize) -> Result<()> {
        if schema.watermark_column.is_none() {
            anyhow::bail!(
                "Sync state tracking needs a watermark column, but schema '{}' has none",
                schema.table
            );
        }
        self.store.ensure_table().await?;
        self.recorded = self
            .store
            .get(&self.state_name)
            .await?
            .and_then(|state| state.last_system_modstamp);
        self.inner.prepare(schema, batch_size).await
    }

    async fn write_batch(&mut self, schema: &TableSchema, rows: &[TypedRow]) -> Result<u64> {
        let committed = self.inner.write_batch(schema, rows).await?;

        let watermark_column = schema
            .watermark_column
            .as_deref()
            .context("Sync state tracking needs a watermark column")?;

        match newest_in_batch(schema, rows, watermark_column) {
            Some((watermark, key)) => {
                if self.recorded.is_some_and(|recorded| recorded >= watermark) {
                    return Ok(committed);
                }
                self.store.update(&self.state_name, key, watermark).await?;
                self.recorded = Some(watermark);
                info!(
                    "SyncState updated for '{}' to Record ID: {}, Modstamp: {}",
                    self.state_name,
                    key.unwrap_or("<none>"),
                    watermark
                );
            }
            None => {
                warn!(
                    "No valid {} found in batch for '{}' sync state update",
                    watermark_column, self.state_name
                );
            }
        }

        Ok(committed)
    }
}
