//! Batched loading of typed rows into a bulk sink

pub mod sink;
pub mod sync;

pub use sink::{SqlSink, WriteMode};
pub use sync::SyncStateSink;

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::ProgressBar;
use std::time::Instant;
use tracing::{debug, info};

use crate::convert::TypedRow;
use crate::schema::TableSchema;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Destination accepting batched row inserts
#[async_trait]
pub trait BulkSink: Send {
    /// Called once before the first batch with the batch size that will be used
    async fn prepare(&mut self, _schema: &TableSchema, _batch_size: usize) -> Result<()> {
        Ok(())
    }

    /// Write one batch and wait for it to complete. Returns the number of
    /// rows the destination reports as committed.
    async fn write_batch(&mut self, schema: &TableSchema, rows: &[TypedRow]) -> Result<u64>;
}

/// Totals for one [`BatchLoader::load`] call
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub rows_attempted: u64,
    pub rows_committed: u64,
    pub batches: usize,
    pub stats: ProgressStats,
}

/// Submits rows to a sink in fixed-size batches, in order
pub struct BatchLoader {
    batch_size: usize,
    progress: ProgressBar,
}

impl BatchLoader {
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be a positive integer");
        }
        Ok(Self {
            batch_size,
            progress: ProgressBar::hidden(),
        })
    }

    /// Advance this bar by the number of rows in each committed batch
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Load all rows. Any sink error aborts the load.
    pub async fn load<S>(
        &self,
        schema: &TableSchema,
        rows: &[TypedRow],
        sink: &mut S,
    ) -> Result<LoadSummary>
    where
        S: BulkSink + ?Sized,
    {
        let mut summary = LoadSummary::default();
        if rows.is_empty() {
            info!("No rows to load");
            return Ok(summary);
        }

        sink.prepare(schema, self.batch_size)
            .await
            .context("Failed to prepare sink")?;

        let total_batches = rows.len().div_ceil(self.batch_size);
        info!(
            "Loading {} rows into '{}' in {} batches of up to {}",
            rows.len(),
            schema.table,
            total_batches,
            self.batch_size
        );

        for (batch_idx, batch) in rows.chunks(self.batch_size).enumerate() {
            let start = Instant::now();
            let committed = sink.write_batch(schema, batch).await.with_context(|| {
                format!(
                    "Batch {} of {} failed after {} of {} rows were committed",
                    batch_idx + 1,
                    total_batches,
                    summary.rows_committed,
                    rows.len()
                )
            })?;

            let event = TelemetryEvent::BatchCommitted {
                rows_attempted: batch.len() as u64,
                rows_committed: committed,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            summary.stats.update(&event);
            summary.rows_attempted += batch.len() as u64;
            summary.rows_committed += committed;
            summary.batches += 1;

            self.progress.inc(batch.len() as u64);
            debug!(
                batch = batch_idx + 1,
                rows = batch.len(),
                committed,
                "batch committed"
            );
        }

        let (p50, p90, p99) = summary.stats.get_percentiles();
        if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
            info!(
                "Batch time p50: {}ms, p90: {}ms, p99: {}ms",
                p50, p90, p99
            );
        }

        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::convert::TypedValue;
    use crate::schema::{ColumnSpec, ColumnType};

    /// Sink that records every batch it receives
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub batches: Vec<Vec<TypedRow>>,
        pub prepared_with: Option<usize>,
        pub fail_on_batch: Option<usize>,
        pub commit_limit: Option<u64>,
    }

    #[async_trait]
    impl BulkSink for RecordingSink {
        async fn prepare(&mut self, _schema: &TableSchema, batch_size: usize) -> Result<()> {
            self.prepared_with = Some(batch_size);
            Ok(())
        }

        async fn write_batch(&mut self, _schema: &TableSchema, rows: &[TypedRow]) -> Result<u64> {
            if self.fail_on_batch == Some(self.batches.len()) {
                anyhow::bail!("connection reset by peer");
            }
            self.batches.push(rows.to_vec());
            let len = rows.len() as u64;
            Ok(self.commit_limit.map_or(len, |limit| len.min(limit)))
        }
    }

    pub(crate) fn id_schema() -> TableSchema {
        TableSchema::new(
            "t",
            Some("id"),
            None,
            vec![ColumnSpec::required("id", ColumnType::Int)],
        )
        .unwrap()
    }

    pub(crate) fn rows(n: i32) -> Vec<TypedRow> {
        (0..n)
            .map(|i| TypedRow {
                values: vec![TypedValue::Int(i)],
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batches_of_exactly_n_in_order() {
        let schema = id_schema();
        let input = rows(2500);
        let mut sink = RecordingSink::default();

        let summary = BatchLoader::new(500)
            .unwrap()
            .load(&schema, &input, &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.batches, 5);
        assert_eq!(summary.rows_attempted, 2500);
        assert_eq!(summary.rows_committed, 2500);
        assert_eq!(sink.prepared_with, Some(500));
        assert_eq!(sink.batches.len(), 5);
        assert!(sink.batches.iter().all(|b| b.len() == 500));

        let flattened: Vec<TypedRow> = sink.batches.into_iter().flatten().collect();
        assert_eq!(flattened, input);
    }

    #[tokio::test]
    async fn test_last_batch_may_be_smaller() {
        let schema = id_schema();
        let mut sink = RecordingSink::default();

        let summary = BatchLoader::new(4)
            .unwrap()
            .load(&schema, &rows(10), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.batches, 3);
        let sizes: Vec<usize> = sink.batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_no_rows_no_batches() {
        let schema = id_schema();
        let mut sink = RecordingSink::default();

        let summary = BatchLoader::new(10)
            .unwrap()
            .load(&schema, &[], &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.batches, 0);
        assert!(sink.batches.is_empty());
        assert_eq!(sink.prepared_with, None);
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let schema = id_schema();
        let mut sink = RecordingSink {
            fail_on_batch: Some(2),
            ..Default::default()
        };

        let err = BatchLoader::new(100)
            .unwrap()
            .load(&schema, &rows(500), &mut sink)
            .await
            .unwrap_err();

        // Batches after the failure are never attempted
        assert_eq!(sink.batches.len(), 2);
        let message = format!("{:#}", err);
        assert!(message.contains("Batch 3 of 5 failed after 200 of 500 rows"));
        assert!(message.contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_committed_can_be_less_than_attempted() {
        let schema = id_schema();
        let mut sink = RecordingSink {
            commit_limit: Some(3),
            ..Default::default()
        };

        let summary = BatchLoader::new(5)
            .unwrap()
            .load(&schema, &rows(10), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.rows_attempted, 10);
        assert_eq!(summary.rows_committed, 6);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(BatchLoader::new(0).is_err());
    }
}
