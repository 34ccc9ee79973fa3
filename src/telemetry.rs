/// Telemetry events emitted while an import runs
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A record failed conversion and was left out of the load set
    RecordRejected,
    /// A batch was written to the sink
    BatchCommitted {
        rows_attempted: u64,
        rows_committed: u64,
        duration_ms: u64,
    },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub batches_committed: usize,
    pub rows_attempted: u64,
    pub rows_committed: u64,
    pub records_rejected: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::RecordRejected => {
                self.records_rejected += 1;
            }
            TelemetryEvent::BatchCommitted {
                rows_attempted,
                rows_committed,
                duration_ms,
            } => {
                self.batches_committed += 1;
                self.rows_attempted += rows_attempted;
                self.rows_committed += rows_committed;
                self.batch_durations_ms.push(*duration_ms);
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
