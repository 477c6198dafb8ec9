//! Per-step execution metrics.
//!
//! Every step records one [`OperationalMetadata`] per run: UTC start and end
//! time, rows processed, and derived duration and throughput. The dataflow
//! aggregates loader row counts into a run-level summary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Run record of a single step execution.
#[derive(Debug, Clone, Serialize)]
pub struct OperationalMetadata {
    /// UTC time the step's execute began.
    pub start_time: DateTime<Utc>,
    /// UTC time the step's execute finished; `None` while running.
    pub end_time: Option<DateTime<Utc>>,
    /// Rows the step processed.
    pub rows_processed: u64,
}

impl OperationalMetadata {
    /// Start a new record, stamped with the current UTC time.
    pub fn started() -> Self {
        OperationalMetadata {
            start_time: Utc::now(),
            end_time: None,
            rows_processed: 0,
        }
    }

    /// Record the processed row count and stamp the end time.
    pub fn processed(&mut self, rows: u64) {
        self.rows_processed = rows;
        self.end_time = Some(Utc::now());
    }

    /// Execution duration in seconds; zero while the step is running.
    pub fn duration_secs(&self) -> f64 {
        match self.end_time {
            Some(end) => {
                let micros = (end - self.start_time).num_microseconds().unwrap_or(0);
                micros as f64 / 1_000_000.0
            }
            None => 0.0,
        }
    }

    /// Rows per second; zero when the duration is zero.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration_secs();
        if secs > 0.0 {
            self.rows_processed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for OperationalMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started at {}, ended at {}, duration {:.3}s, rows processed {}, throughput {:.0} rows/sec",
            self.start_time,
            self.end_time
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.duration_secs(),
            self.rows_processed,
            self.throughput(),
        )
    }
}

/// One entry of [`crate::graph::Dataflow::execution_report`].
#[derive(Debug, Serialize)]
pub struct StepReport<'a> {
    pub step: &'a str,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<&'a OperationalMetadata>,
}
