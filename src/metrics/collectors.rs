//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code and tests can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERED_TOTAL, EVALUATION_DURATION, INGESTED_TOTAL,
    MESSAGES_PROCESSED_TOTAL, RECLAIMED_TOTAL, STORE_ERRORS_TOTAL, STREAM_DEPTH,
};

/// Outcome label of an evaluated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Evaluated and acknowledged.
    Acknowledged,
    /// Failed and left pending for another delivery.
    Retry,
    /// Failed for the last time and dead-lettered.
    DeadLettered,
}

impl ProcessOutcome {
    /// Prometheus label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessOutcome::Acknowledged => "acknowledged",
            ProcessOutcome::Retry => "retry",
            ProcessOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Metrics collector for recording dacrew operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one webhook request and its outcome.
    pub fn record_ingest(&self, outcome: &str) {
        if let Some(ingested) = INGESTED_TOTAL.get() {
            ingested.with_label_values(&[outcome]).inc();
        }
    }

    /// Record the outcome of one evaluation.
    pub fn record_processed(&self, outcome: ProcessOutcome, duration: Duration) {
        if let Some(processed) = MESSAGES_PROCESSED_TOTAL.get() {
            processed.with_label_values(&[outcome.as_label()]).inc();
        }

        if let Some(histogram) = EVALUATION_DURATION.get() {
            histogram.observe(duration.as_secs_f64());
        }

        if outcome == ProcessOutcome::DeadLettered {
            self.record_dead_letter();
        }

        tracing::trace!(
            outcome = outcome.as_label(),
            duration_ms = duration.as_millis() as u64,
            "Recorded evaluation metric"
        );
    }

    /// Record a message moved to a dead letter stream.
    pub fn record_dead_letter(&self) {
        if let Some(counter) = DEAD_LETTERED_TOTAL.get() {
            counter.inc();
        }
    }

    /// Record claims released by the reclaimer.
    pub fn record_reclaimed(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(counter) = RECLAIMED_TOTAL.get() {
            counter.inc_by(count as f64);
        }
    }

    /// Record a failed stream store call.
    pub fn record_store_error(&self, operation: &str) {
        if let Some(errors) = STORE_ERRORS_TOTAL.get() {
            errors.with_label_values(&[operation]).inc();
        }
    }

    /// Increment the number of busy workers.
    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    /// Decrement the number of busy workers.
    pub fn worker_finished(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }

    /// Set the current length of a stream.
    pub fn set_stream_depth(&self, stream: &str, depth: usize) {
        if let Some(gauge) = STREAM_DEPTH.get() {
            gauge.with_label_values(&[stream]).set(depth as f64);
        }
    }
}
