//! Periodic release of orphaned claims.
//!
//! A claim whose owner stopped (crash, kill, lost network) would otherwise
//! stay attached to that consumer. The reclaimer clears ownership of every
//! pending entry idle for at least the orphan timeout, after which any
//! worker's next poll picks it up with an incremented delivery count.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::stats::SharedPoolStats;
use crate::metrics::MetricsCollector;
use crate::stream::{StoreError, StreamStore};

/// Scans all streams for orphaned claims on a fixed interval.
pub struct OrphanReclaimer {
    store: Arc<dyn StreamStore>,
    group: String,
    orphan_timeout: Duration,
    interval: Duration,
    stats: Option<Arc<SharedPoolStats>>,
    metrics: MetricsCollector,
}

impl OrphanReclaimer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        group: impl Into<String>,
        orphan_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            group: group.into(),
            orphan_timeout,
            interval,
            stats: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Counts released claims into the pool statistics.
    pub fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Releases every claim on `stream_key` idle for at least `orphan_timeout`.
    ///
    /// Entries acknowledged or re-claimed between listing and release are
    /// skipped. Returns how many claims were released.
    pub async fn reclaim_pass(
        &self,
        stream_key: &str,
        group: &str,
        orphan_timeout: Duration,
    ) -> Result<usize, StoreError> {
        let orphans = self
            .store
            .pending_entries(stream_key, group, orphan_timeout)
            .await?;

        let mut released = 0;
        for entry in orphans {
            if self
                .store
                .release(stream_key, group, &entry.message_id, orphan_timeout)
                .await?
            {
                info!(
                    stream = %stream_key,
                    message_id = %entry.message_id,
                    previous_owner = %entry.consumer_id,
                    delivery_count = entry.delivery_count,
                    "Released orphaned claim"
                );
                released += 1;
            }
        }

        Ok(released)
    }

    /// Runs one pass over every known stream and refreshes depth gauges.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let mut released = 0;

        for stream_key in self.store.streams().await? {
            match self
                .reclaim_pass(&stream_key, &self.group, self.orphan_timeout)
                .await
            {
                Ok(count) => released += count,
                Err(e) => {
                    self.metrics.record_store_error("reclaim");
                    warn!(stream = %stream_key, error = %e, "Reclaim pass failed");
                    continue;
                }
            }

            if let Ok(stats) = self.store.stats(&stream_key, &self.group).await {
                self.metrics.set_stream_depth(&stream_key, stats.length);
            }
        }

        self.metrics.record_reclaimed(released);
        if let Some(stats) = &self.stats {
            stats.record_released(released);
        }

        Ok(released)
    }

    /// Sweeps every `interval` until a shutdown signal arrives.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            orphan_timeout_ms = self.orphan_timeout.as_millis() as u64,
            "Orphan reclaimer started"
        );

        loop {
            match self.sweep().await {
                Ok(0) => debug!("No orphaned claims"),
                Ok(released) => info!(released, "Orphan sweep finished"),
                Err(e) => {
                    self.metrics.record_store_error("reclaim");
                    warn!(error = %e, "Orphan sweep failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Orphan reclaimer stopped");
    }
}
