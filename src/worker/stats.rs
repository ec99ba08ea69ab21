//! Pool statistics shared by the workers of one process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently evaluating a message.
    pub active_workers: usize,
    /// Messages evaluated successfully.
    pub messages_acknowledged: u64,
    /// Failed evaluations left pending for another delivery.
    pub messages_failed: u64,
    /// Messages moved to a dead letter stream.
    pub messages_dead_lettered: u64,
    /// Orphaned claims released by the reclaimer.
    pub orphans_released: u64,
    /// Average evaluation duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of evaluations (successful or not).
    pub fn total_processed(&self) -> u64 {
        self.messages_acknowledged + self.messages_failed + self.messages_dead_lettered
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.messages_acknowledged as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub struct SharedPoolStats {
    acknowledged: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    released: AtomicU64,
    evaluated: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_acknowledged(&self, duration: Duration) {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        self.record_duration(duration);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.record_duration(duration);
    }

    /// Counts a dead letter. Its evaluation, if there was one, is recorded
    /// separately through [`SharedPoolStats::record_evaluation`].
    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_evaluation(&self, duration: Duration) {
        self.record_duration(duration);
    }

    pub(crate) fn record_released(&self, count: usize) {
        self.released.fetch_add(count as u64, Ordering::SeqCst);
    }

    fn record_duration(&self, duration: Duration) {
        self.evaluated.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let evaluated = self.evaluated.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if evaluated > 0 {
            Duration::from_millis(total_duration_ms / evaluated)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            messages_acknowledged: self.acknowledged.load(Ordering::SeqCst),
            messages_failed: self.failed.load(Ordering::SeqCst),
            messages_dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            orphans_released: self.released.load(Ordering::SeqCst),
            average_duration,
        }
    }
}
