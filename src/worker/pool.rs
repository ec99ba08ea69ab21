//! Pool of workers sharing one stream store.
//!
//! A process runs `num_workers` [`Worker`] tasks plus one
//! [`OrphanReclaimer`]. Consumer ids combine a per-process instance id with
//! the worker index, so several processes can join the same consumer group.
//!
//! # Features
//!
//! - Graceful shutdown with a broadcast channel
//! - In-flight batches drained before exit, bounded by a timeout
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::consumer::Worker;
use super::reclaimer::OrphanReclaimer;
use super::stats::{PoolStats, SharedPoolStats};
use crate::config::WorkerConfig;
use crate::error::EvaluationError;
use crate::evaluator::{self, IssueEvaluator};
use crate::stream::{self, StoreError, StreamStore};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to open the stream store.
    #[error("Stream store connection failed: {0}")]
    Store(#[from] StoreError),

    /// The configured evaluator could not be built.
    #[error("Evaluator initialization failed: {0}")]
    Evaluator(#[from] EvaluationError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Worker pool that manages multiple workers consuming the same streams.
pub struct WorkerPool {
    config: WorkerConfig,
    store: Arc<dyn StreamStore>,
    evaluator: Arc<dyn IssueEvaluator>,
    instance_id: Uuid,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Opens the configured store and evaluator and creates a pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the store cannot be reached or the evaluator
    /// cannot be built.
    pub async fn connect(config: WorkerConfig) -> Result<Self, PoolError> {
        let store =
            stream::open_store(&config.redis_url, &config.stream_prefix, config.orphan_timeout)
                .await?;
        let evaluator = evaluator::from_config(&config)?;
        Ok(Self::new(config, store, evaluator))
    }

    /// Creates a pool over an existing store and evaluator.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn StreamStore>,
        evaluator: Arc<dyn IssueEvaluator>,
    ) -> Self {
        // Sent once; a single slot is enough.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            evaluator,
            instance_id: Uuid::new_v4(),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the workers and the orphan reclaimer.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let options = self.config.worker_options();
        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                self.consumer_id(i),
                Arc::clone(&self.store),
                Arc::clone(&self.evaluator),
                options.clone(),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.stats),
            );
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        let reclaimer = OrphanReclaimer::new(
            Arc::clone(&self.store),
            self.config.consumer_group.clone(),
            self.config.orphan_timeout,
            self.config.reclaim_interval,
        )
        .with_stats(Arc::clone(&self.stats));
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.worker_handles
            .push(tokio::spawn(reclaimer.run(shutdown_rx)));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            instance_id = %self.instance_id,
            num_workers = self.config.num_workers,
            group = %self.config.consumer_group,
            evaluator = self.evaluator.name(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every task to stop and waits for in-flight batches.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if the tasks do not finish within
    /// the configured shutdown timeout. Messages still being evaluated then
    /// are recovered later through the orphan timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Tasks that already exited have dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let timeout = self.config.shutdown_timeout;
        let result = tokio::time::timeout(timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                for handle in self.worker_handles.drain(..) {
                    handle.abort();
                }
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns the shared stream store.
    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    fn consumer_id(&self, index: usize) -> String {
        let instance = self.instance_id.simple().to_string();
        format!("{}-worker-{}", &instance[..8], index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::MockEvaluator;
    use crate::stream::MemoryStreamStore;

    fn pool(num_workers: usize) -> WorkerPool {
        let config = WorkerConfig::default()
            .with_num_workers(num_workers)
            .with_poll_interval(Duration::from_millis(10));
        let store = Arc::new(MemoryStreamStore::new(config.orphan_timeout));
        WorkerPool::new(config, store, Arc::new(MockEvaluator::new(Duration::ZERO)))
    }

    #[test]
    fn test_consumer_ids_are_distinct() {
        let pool = pool(2);
        let first = pool.consumer_id(0);
        let second = pool.consumer_id(1);

        assert_ne!(first, second);
        assert!(first.ends_with("-worker-0"));
        assert_ne!(pool.consumer_id(0), self::pool(1).consumer_id(0));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut pool = pool(2);
        assert!(!pool.is_running());

        pool.start().expect("start");
        assert!(pool.is_running());
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        pool.shutdown().await.expect("shutdown");
        assert!(!pool.is_running());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_pool_processes_messages() {
        let mut pool = pool(2);
        let event = crate::webhook::JiraEvent::parse(br#"{"issue":"ABC-1","event":"created"}"#)
            .expect("event");
        let payload = serde_json::to_value(&event).expect("payload");
        pool.store()
            .append("dacrew:jira:ABC", &payload)
            .await
            .expect("append");

        pool.start().expect("start");
        for _ in 0..100 {
            if pool.stats().messages_acknowledged == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await.expect("shutdown");

        assert_eq!(pool.stats().messages_acknowledged, 1);
        assert_eq!(pool.stats().num_workers, 2);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert_eq!(err.to_string(), "Pool is already running");

        let err = PoolError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}
