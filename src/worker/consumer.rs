//! A single competing consumer.
//!
//! Each worker loops over claim, evaluate, then acknowledge or dead-letter,
//! polling every known stream in turn. A failed evaluation is not
//! acknowledged: the claim is left to lapse and the message comes back
//! through [`StreamStore::claim_batch`] with a higher delivery count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::retry::{Backoff, RetryDecision, RetryPolicy};
use super::stats::SharedPoolStats;
use crate::error::EvaluationError;
use crate::evaluator::IssueEvaluator;
use crate::metrics::{MetricsCollector, ProcessOutcome};
use crate::stream::{Envelope, StoreError, StreamStore};

/// Per-worker settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Consumer group shared by all workers.
    pub group: String,
    /// Maximum messages claimed per poll, across all streams.
    pub batch_size: usize,
    /// Wait after a poll that claimed nothing.
    pub poll_interval: Duration,
    /// Upper bound on a single evaluation.
    pub evaluation_timeout: Duration,
    /// When a failed message is dead-lettered.
    pub retry_policy: RetryPolicy,
    /// Delay schedule after store failures.
    pub backoff: Backoff,
}

/// Lifecycle of a worker, mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Acknowledging,
    RetryScheduled,
    DeadLettered,
    Stopped,
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Envelopes claimed.
    pub claimed: usize,
    /// Evaluated successfully and acknowledged.
    pub acknowledged: usize,
    /// Failed and left pending for another delivery.
    pub retried: usize,
    /// Moved to a dead letter stream.
    pub dead_lettered: usize,
    /// Acknowledgements or dead letters that found the entry already gone.
    pub lost_races: usize,
}

impl BatchReport {
    /// Whether the poll found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// A competing consumer bound to one consumer id.
pub struct Worker {
    id: String,
    store: Arc<dyn StreamStore>,
    evaluator: Arc<dyn IssueEvaluator>,
    options: WorkerOptions,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    state: WorkerState,
    stopping: bool,
    /// Offset of the first stream polled next time.
    next_stream: usize,
}

impl Worker {
    /// Creates a worker using `id` as its consumer id.
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn StreamStore>,
        evaluator: Arc<dyn IssueEvaluator>,
        options: WorkerOptions,
        shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            evaluator,
            options,
            shutdown_rx,
            stats,
            metrics: MetricsCollector::new(),
            state: WorkerState::Idle,
            stopping: false,
            next_stream: 0,
        }
    }

    /// Returns the worker's consumer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Main worker loop.
    ///
    /// Polls until a shutdown signal arrives. A batch that is already claimed
    /// is always finished before the loop exits.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, evaluator = self.evaluator.name(), "Worker started");

        while !self.shutdown_requested() {
            match self.run_once().await {
                Ok(report) if report.is_empty() => {
                    debug!(worker_id = %self.id, "No messages available");
                    self.options.backoff.reset();
                    self.wait(self.options.poll_interval).await;
                }
                Ok(report) => {
                    self.options.backoff.reset();
                    debug!(
                        worker_id = %self.id,
                        claimed = report.claimed,
                        acknowledged = report.acknowledged,
                        retried = report.retried,
                        dead_lettered = report.dead_lettered,
                        "Batch finished"
                    );
                }
                Err(e) => {
                    self.metrics.record_store_error("claim");
                    let delay = self.options.backoff.next_delay();
                    if e.is_transient() {
                        warn!(worker_id = %self.id, error = %e, delay_ms = delay.as_millis() as u64, "Stream store unavailable, backing off");
                    } else {
                        error!(worker_id = %self.id, error = %e, delay_ms = delay.as_millis() as u64, "Failed to claim messages");
                    }
                    self.wait(delay).await;
                }
            }
        }

        self.state = WorkerState::Stopped;
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claims one batch across all streams and processes it to completion.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` only if nothing could be claimed. Failures after
    /// the first successful claim are logged and the claimed envelopes are
    /// still processed.
    pub async fn run_once(&mut self) -> Result<BatchReport, StoreError> {
        self.state = WorkerState::Polling;
        let batch = match self.claim_round().await {
            Ok(batch) => batch,
            Err(e) => {
                self.state = WorkerState::Idle;
                return Err(e);
            }
        };

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };

        for envelope in batch {
            self.process(envelope, &mut report).await;
        }

        self.state = WorkerState::Idle;
        Ok(report)
    }

    async fn claim_round(&mut self) -> Result<Vec<Envelope>, StoreError> {
        let streams = self.store.streams().await?;
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let start = self.next_stream % streams.len();
        self.next_stream = self.next_stream.wrapping_add(1);

        let mut batch = Vec::new();
        for stream_key in streams.iter().cycle().skip(start).take(streams.len()) {
            let remaining = self.options.batch_size.saturating_sub(batch.len());
            if remaining == 0 {
                break;
            }

            match self
                .store
                .claim_batch(stream_key, &self.options.group, &self.id, remaining)
                .await
            {
                Ok(claimed) => batch.extend(claimed),
                Err(e) if batch.is_empty() => return Err(e),
                Err(e) => {
                    self.metrics.record_store_error("claim");
                    warn!(worker_id = %self.id, stream = %stream_key, error = %e, "Claim failed, processing partial batch");
                    break;
                }
            }
        }

        Ok(batch)
    }

    async fn process(&mut self, envelope: Envelope, report: &mut BatchReport) {
        let policy = self.options.retry_policy;

        if policy.is_exhausted(envelope.delivery_count) {
            warn!(
                worker_id = %self.id,
                message_id = %envelope.id,
                delivery_count = envelope.delivery_count,
                max_deliveries = policy.max_deliveries(),
                "Delivery budget exhausted before evaluation"
            );
            let reason = format!(
                "delivered {} times, exceeding the limit of {}",
                envelope.delivery_count,
                policy.max_deliveries()
            );
            self.dead_letter(&envelope, &reason, None, report).await;
            return;
        }

        info!(
            worker_id = %self.id,
            stream = %envelope.stream_key,
            message_id = %envelope.id,
            delivery_count = envelope.delivery_count,
            "Processing message"
        );

        self.state = WorkerState::Processing;
        self.stats.increment_active();
        self.metrics.worker_started();
        let started = Instant::now();

        let result = self.evaluate(&envelope).await;

        let duration = started.elapsed();
        self.stats.decrement_active();
        self.metrics.worker_finished();

        match result {
            Ok(()) => {
                self.state = WorkerState::Acknowledging;
                self.stats.record_acknowledged(duration);
                self.metrics
                    .record_processed(ProcessOutcome::Acknowledged, duration);
                self.acknowledge(&envelope, report).await;
            }
            Err(e) => match policy.after_failure(envelope.delivery_count) {
                RetryDecision::Retry { remaining } => {
                    self.state = WorkerState::RetryScheduled;
                    self.stats.record_failure(duration);
                    self.metrics.record_processed(ProcessOutcome::Retry, duration);
                    report.retried += 1;
                    warn!(
                        worker_id = %self.id,
                        message_id = %envelope.id,
                        delivery_count = envelope.delivery_count,
                        remaining,
                        error = %e,
                        "Evaluation failed, message left pending for retry"
                    );
                }
                RetryDecision::DeadLetter => {
                    self.stats.record_evaluation(duration);
                    self.dead_letter(&envelope, &e.to_string(), Some(duration), report)
                        .await;
                }
            },
        }
    }

    async fn evaluate(&self, envelope: &Envelope) -> Result<(), EvaluationError> {
        let timeout = self.options.evaluation_timeout;
        match tokio::time::timeout(timeout, self.evaluator.process(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(EvaluationError::Timeout(timeout)),
        }
    }

    async fn acknowledge(&self, envelope: &Envelope, report: &mut BatchReport) {
        match self
            .store
            .acknowledge(&envelope.stream_key, &self.options.group, &envelope.id)
            .await
        {
            Ok(true) => {
                report.acknowledged += 1;
                info!(worker_id = %self.id, message_id = %envelope.id, "Message acknowledged");
            }
            Ok(false) => {
                report.lost_races += 1;
                warn!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    "Message was no longer pending at acknowledgement"
                );
            }
            Err(e) => {
                self.metrics.record_store_error("acknowledge");
                error!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    error = %e,
                    "Failed to acknowledge message, it will be delivered again"
                );
            }
        }
    }

    /// `evaluated` is the duration of the final failed evaluation, if the
    /// message was evaluated at all.
    async fn dead_letter(
        &mut self,
        envelope: &Envelope,
        reason: &str,
        evaluated: Option<Duration>,
        report: &mut BatchReport,
    ) {
        self.state = WorkerState::DeadLettered;
        match self
            .store
            .dead_letter(&self.options.group, envelope, reason)
            .await
        {
            Ok(true) => {
                report.dead_lettered += 1;
                self.stats.record_dead_letter();
                match evaluated {
                    Some(duration) => self
                        .metrics
                        .record_processed(ProcessOutcome::DeadLettered, duration),
                    None => self.metrics.record_dead_letter(),
                }
                error!(
                    worker_id = %self.id,
                    stream = %envelope.stream_key,
                    message_id = %envelope.id,
                    delivery_count = envelope.delivery_count,
                    reason,
                    "Message dead-lettered"
                );
            }
            Ok(false) => {
                report.lost_races += 1;
                warn!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    "Message was no longer pending, not dead-lettered"
                );
            }
            Err(e) => {
                self.metrics.record_store_error("dead_letter");
                error!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    error = %e,
                    "Failed to dead-letter message"
                );
            }
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        if self.stopping {
            return true;
        }
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                info!(worker_id = %self.id, "Worker received shutdown signal");
                self.stopping = true;
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => self.stopping = true,
            Err(broadcast::error::TryRecvError::Empty) => {}
        }
        self.stopping
    }

    /// Sleeps for `delay` unless a shutdown signal arrives first.
    async fn wait(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown_rx.recv() => {
                info!(worker_id = %self.id, "Worker received shutdown signal");
                self.stopping = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::MESSAGES_PROCESSED_TOTAL;
    use crate::stream::{DeadLetter, MemoryStreamStore, MessageId, PendingEntry, StreamStats};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    const STREAM: &str = "dacrew:jira:ABC";
    const GROUP: &str = "workers";

    struct ScriptedEvaluator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IssueEvaluator for ScriptedEvaluator {
        async fn process(&self, _envelope: &Envelope) -> Result<(), EvaluationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EvaluationError::Failed("boom".to_string()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn options(max_retries: u32) -> WorkerOptions {
        WorkerOptions {
            group: GROUP.to_string(),
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            evaluation_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::new(max_retries),
            backoff: Backoff::default(),
        }
    }

    fn worker(
        store: Arc<dyn StreamStore>,
        evaluator: Arc<ScriptedEvaluator>,
        max_retries: u32,
    ) -> (Worker, broadcast::Sender<()>) {
        let (tx, rx) = broadcast::channel(1);
        let worker = Worker::new(
            "worker-0",
            store,
            evaluator,
            options(max_retries),
            rx,
            Arc::new(SharedPoolStats::new()),
        );
        (worker, tx)
    }

    #[tokio::test]
    async fn test_run_once_acknowledges_success() {
        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        store.append(STREAM, &serde_json::json!({"n": 1})).await.expect("append");
        store.append(STREAM, &serde_json::json!({"n": 2})).await.expect("append");

        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: false });
        let (mut worker, _tx) = worker(store.clone(), evaluator.clone(), 3);

        let report = worker.run_once().await.expect("run");

        assert_eq!(report.claimed, 2);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").pending, 0);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_failure_leaves_message_pending() {
        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        store.append(STREAM, &serde_json::json!({"n": 1})).await.expect("append");

        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: true });
        let (mut worker, _tx) = worker(store.clone(), evaluator, 3);

        let report = worker.run_once().await.expect("run");

        assert_eq!(report.retried, 1);
        assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").pending, 1);
        assert!(store.dead_letters(STREAM, 10).await.expect("dead").is_empty());
    }

    #[tokio::test]
    async fn test_zero_retries_dead_letters_immediately() {
        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        store.append(STREAM, &serde_json::json!({"n": 1})).await.expect("append");

        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: true });
        let (mut worker, _tx) = worker(store.clone(), evaluator, 0);

        let report = worker.run_once().await.expect("run");

        assert_eq!(report.dead_lettered, 1);
        let dead = store.dead_letters(STREAM, 10).await.expect("dead");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("boom"));
        assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").pending, 0);
    }

    #[tokio::test]
    async fn test_empty_store_claims_nothing() {
        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: false });
        let (mut worker, _tx) = worker(store, evaluator, 3);

        assert!(worker.run_once().await.expect("run").is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: false });
        let (worker, tx) = worker(store, evaluator, 3);

        let handle = tokio::spawn(worker.run());
        tx.send(()).expect("send shutdown");

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stops")
            .expect("worker does not panic");
    }

    /// Evaluator that takes a while and reports when the first call starts.
    struct SlowEvaluator {
        calls: AtomicUsize,
        started: Notify,
        delay: Duration,
    }

    #[async_trait]
    impl IssueEvaluator for SlowEvaluator {
        async fn process(&self, _envelope: &Envelope) -> Result<(), EvaluationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    /// Memory store whose stream listing fails a fixed number of times.
    struct FlakyStore {
        inner: MemoryStreamStore,
        failures_left: AtomicUsize,
        listed_at: Mutex<Vec<Instant>>,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStreamStore::new(Duration::from_secs(60)),
                failures_left: AtomicUsize::new(failures),
                listed_at: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamStore for FlakyStore {
        async fn append(
            &self,
            stream_key: &str,
            payload: &serde_json::Value,
        ) -> Result<MessageId, StoreError> {
            self.inner.append(stream_key, payload).await
        }

        async fn claim_batch(
            &self,
            stream_key: &str,
            group: &str,
            consumer_id: &str,
            max_count: usize,
        ) -> Result<Vec<Envelope>, StoreError> {
            self.inner
                .claim_batch(stream_key, group, consumer_id, max_count)
                .await
        }

        async fn acknowledge(
            &self,
            stream_key: &str,
            group: &str,
            message_id: &MessageId,
        ) -> Result<bool, StoreError> {
            self.inner.acknowledge(stream_key, group, message_id).await
        }

        async fn pending_entries(
            &self,
            stream_key: &str,
            group: &str,
            older_than: Duration,
        ) -> Result<Vec<PendingEntry>, StoreError> {
            self.inner.pending_entries(stream_key, group, older_than).await
        }

        async fn release(
            &self,
            stream_key: &str,
            group: &str,
            message_id: &MessageId,
            older_than: Duration,
        ) -> Result<bool, StoreError> {
            self.inner
                .release(stream_key, group, message_id, older_than)
                .await
        }

        async fn dead_letter(
            &self,
            group: &str,
            envelope: &Envelope,
            reason: &str,
        ) -> Result<bool, StoreError> {
            self.inner.dead_letter(group, envelope, reason).await
        }

        async fn dead_letters(
            &self,
            stream_key: &str,
            limit: usize,
        ) -> Result<Vec<DeadLetter>, StoreError> {
            self.inner.dead_letters(stream_key, limit).await
        }

        async fn streams(&self) -> Result<Vec<String>, StoreError> {
            self.listed_at.lock().expect("lock").push(Instant::now());
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.streams().await
        }

        async fn stats(&self, stream_key: &str, group: &str) -> Result<StreamStats, StoreError> {
            self.inner.stats(stream_key, group).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_claimed_batch() {
        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        for n in 1..=3 {
            store.append(STREAM, &serde_json::json!({"n": n})).await.expect("append");
        }

        let evaluator = Arc::new(SlowEvaluator {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            delay: Duration::from_millis(100),
        });
        let (tx, rx) = broadcast::channel(1);
        let mut opts = options(3);
        opts.batch_size = 2;
        let worker = Worker::new(
            "worker-0",
            store.clone(),
            evaluator.clone(),
            opts,
            rx,
            Arc::new(SharedPoolStats::new()),
        );

        let handle = tokio::spawn(worker.run());
        evaluator.started.notified().await;
        tx.send(()).expect("send shutdown");

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stops")
            .expect("worker does not panic");

        // Both claimed messages finished, the third was never touched.
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").pending, 0);

        let rest = store
            .claim_batch(STREAM, GROUP, "worker-1", 10)
            .await
            .expect("claim");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload["n"], 3);
        assert_eq!(rest[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn test_store_outage_backs_off_then_recovers() {
        let store = Arc::new(FlakyStore::new(3));
        store.append(STREAM, &serde_json::json!({"n": 1})).await.expect("append");

        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: false });
        let (tx, rx) = broadcast::channel(1);
        let mut opts = options(3);
        opts.backoff = Backoff::new(Duration::from_millis(20), Duration::from_secs(1));
        let worker = Worker::new(
            "worker-0",
            store.clone(),
            evaluator.clone(),
            opts,
            rx,
            Arc::new(SharedPoolStats::new()),
        );
        let handle = tokio::spawn(worker.run());

        let processed = tokio::time::timeout(Duration::from_secs(5), async {
            while evaluator.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(processed.is_ok(), "worker never recovered from the outage");
        assert!(!handle.is_finished());

        tx.send(()).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stops")
            .expect("worker does not panic");

        assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").pending, 0);

        let listed_at = store.listed_at.lock().expect("lock").clone();
        assert!(listed_at.len() >= 4);
        let gaps: Vec<Duration> = listed_at.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(20));
        assert!(gaps[1] >= Duration::from_millis(40));
        assert!(gaps[2] >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_final_failure_is_recorded_as_dead_lettered() {
        crate::metrics::init_metrics().expect("metrics");
        let dead_lettered = || {
            MESSAGES_PROCESSED_TOTAL
                .get()
                .expect("initialized")
                .with_label_values(&["dead_lettered"])
                .get()
        };
        let before = dead_lettered();

        let store = Arc::new(MemoryStreamStore::new(Duration::from_secs(60)));
        store.append(STREAM, &serde_json::json!({"n": 1})).await.expect("append");
        let evaluator = Arc::new(ScriptedEvaluator { calls: AtomicUsize::new(0), fail: true });
        let (mut worker, _tx) = worker(store, evaluator, 0);

        let report = worker.run_once().await.expect("run");

        assert_eq!(report.dead_lettered, 1);
        assert!(dead_lettered() >= before + 1.0);
    }
}
