//! End-to-end delivery guarantees against the in-memory store.
//!
//! Time is driven by a manual clock so orphan timeouts are exact.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use dacrew::clock::ManualClock;
use dacrew::error::EvaluationError;
use dacrew::evaluator::IssueEvaluator;
use dacrew::ingest::Producer;
use dacrew::stream::{Envelope, MemoryStreamStore, MessageId, StreamStore};
use dacrew::webhook::sign_payload;
use dacrew::worker::{
    Backoff, OrphanReclaimer, RetryPolicy, SharedPoolStats, Worker, WorkerOptions,
};

const SECRET: &[u8] = b"integration-secret";
const PREFIX: &str = "dacrew:jira";
const STREAM: &str = "dacrew:jira:ABC";
const GROUP: &str = "dacrew_work_consumers";
const ORPHAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Evaluator that counts calls and fails on demand.
struct CountingEvaluator {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingEvaluator {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssueEvaluator for CountingEvaluator {
    async fn process(&self, _envelope: &Envelope) -> Result<(), EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(EvaluationError::Failed("evaluator unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn store_with_clock() -> (Arc<MemoryStreamStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStreamStore::with_clock(ORPHAN_TIMEOUT, clock.clone()));
    (store, clock)
}

fn worker(
    id: &str,
    store: Arc<MemoryStreamStore>,
    evaluator: Arc<CountingEvaluator>,
    batch_size: usize,
    max_retries: u32,
) -> (Worker, broadcast::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let options = WorkerOptions {
        group: GROUP.to_string(),
        batch_size,
        poll_interval: Duration::from_millis(10),
        evaluation_timeout: Duration::from_secs(5),
        retry_policy: RetryPolicy::new(max_retries),
        backoff: Backoff::default(),
    };
    let worker = Worker::new(
        id,
        store,
        evaluator,
        options,
        shutdown_rx,
        Arc::new(SharedPoolStats::new()),
    );
    (worker, shutdown_tx)
}

async fn append_events(store: &MemoryStreamStore, count: usize) {
    for n in 0..count {
        store
            .append(STREAM, &serde_json::json!({"issue_key": format!("ABC-{}", n + 1)}))
            .await
            .expect("append");
    }
}

#[tokio::test]
async fn test_accepted_ingest_appends_exactly_once() {
    let (store, _clock) = store_with_clock();
    let producer = Producer::new(store.clone(), SECRET, PREFIX);

    let body = br#"{"issue":"ABC-1","event":"updated"}"#;
    let signature = sign_payload(body, SECRET);

    let id = producer
        .ingest(body, Some(&signature))
        .await
        .expect("accepted");

    assert_eq!(id, MessageId::from_sequence(1));
    assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").length, 1);
}

#[tokio::test]
async fn test_rejected_ingest_appends_nothing() {
    let (store, _clock) = store_with_clock();
    let producer = Producer::new(store.clone(), SECRET, PREFIX);
    let body = br#"{"issue":"ABC-1","event":"updated"}"#;

    let wrong = sign_payload(body, b"other-secret");
    assert!(producer.ingest(body, Some(&wrong)).await.is_err());
    assert!(producer.ingest(body, None).await.is_err());

    let malformed = b"not json";
    let signature = sign_payload(malformed, SECRET);
    assert!(producer.ingest(malformed, Some(&signature)).await.is_err());

    assert!(store.streams().await.expect("streams").is_empty());
}

#[tokio::test]
async fn test_single_event_processed_and_acknowledged() {
    let (store, _clock) = store_with_clock();
    let producer = Producer::new(store.clone(), SECRET, PREFIX);

    let body = br#"{"issue":"ABC-1","event":"updated"}"#;
    let id = producer
        .ingest(body, Some(&sign_payload(body, SECRET)))
        .await
        .expect("accepted");
    assert_eq!(id.as_str(), "1");

    let claimed = store
        .claim_batch(STREAM, GROUP, "worker-a", 1)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].delivery_count, 1);
    assert_eq!(claimed[0].payload["issue_key"], "ABC-1");

    let evaluator = CountingEvaluator::succeeding();
    evaluator.process(&claimed[0]).await.expect("evaluate");

    assert!(store.acknowledge(STREAM, GROUP, &id).await.expect("ack"));
    assert!(store
        .claim_batch(STREAM, GROUP, "worker-a", 1)
        .await
        .expect("claim")
        .is_empty());
}

#[tokio::test]
async fn test_second_acknowledge_returns_false() {
    let (store, _clock) = store_with_clock();
    append_events(&store, 1).await;

    let claimed = store
        .claim_batch(STREAM, GROUP, "worker-a", 1)
        .await
        .expect("claim");
    let id = &claimed[0].id;

    assert!(store.acknowledge(STREAM, GROUP, id).await.expect("ack"));
    assert!(!store.acknowledge(STREAM, GROUP, id).await.expect("ack"));
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let (store, _clock) = store_with_clock();
    append_events(&store, 5).await;

    let (a, b) = tokio::join!(
        store.claim_batch(STREAM, GROUP, "worker-a", 5),
        store.claim_batch(STREAM, GROUP, "worker-b", 5),
    );
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    let ids_a: HashSet<_> = a.iter().map(|e| e.id.clone()).collect();
    let ids_b: HashSet<_> = b.iter().map(|e| e.id.clone()).collect();

    assert!(ids_a.is_disjoint(&ids_b));
    assert_eq!(ids_a.len() + ids_b.len(), 5);
}

#[tokio::test]
async fn test_claim_expires_at_exact_orphan_timeout() {
    let (store, clock) = store_with_clock();
    append_events(&store, 1).await;

    store
        .claim_batch(STREAM, GROUP, "crashed-worker", 1)
        .await
        .expect("claim");

    clock.advance(ORPHAN_TIMEOUT - Duration::from_millis(1));
    assert!(store
        .claim_batch(STREAM, GROUP, "worker-b", 1)
        .await
        .expect("claim")
        .is_empty());

    clock.advance(Duration::from_millis(1));
    let reclaimed = store
        .claim_batch(STREAM, GROUP, "worker-b", 1)
        .await
        .expect("claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].delivery_count, 2);
}

#[tokio::test]
async fn test_no_message_in_two_pending_entries() {
    let (store, clock) = store_with_clock();
    append_events(&store, 3).await;

    store
        .claim_batch(STREAM, GROUP, "worker-a", 3)
        .await
        .expect("claim");
    clock.advance(ORPHAN_TIMEOUT);
    store
        .claim_batch(STREAM, GROUP, "worker-b", 2)
        .await
        .expect("claim");

    let pending = store
        .pending_entries(STREAM, GROUP, Duration::ZERO)
        .await
        .expect("pending");
    let ids: HashSet<_> = pending.iter().map(|p| p.message_id.clone()).collect();

    assert_eq!(pending.len(), 3);
    assert_eq!(ids.len(), 3);
    assert_eq!(
        pending.iter().filter(|p| p.consumer_id == "worker-b").count(),
        2
    );
}

#[tokio::test]
async fn test_failing_message_dead_lettered_after_budget() {
    let (store, clock) = store_with_clock();
    append_events(&store, 1).await;

    let evaluator = CountingEvaluator::failing();
    let (mut worker, _shutdown) = worker("worker-a", store.clone(), evaluator.clone(), 1, 2);

    for delivery in 1..=3 {
        let report = worker.run_once().await.expect("poll");
        assert_eq!(report.claimed, 1, "delivery {}", delivery);
        clock.advance(ORPHAN_TIMEOUT);
    }

    assert_eq!(evaluator.calls(), 3);

    let dead = store.dead_letters(STREAM, 10).await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.delivery_count, 3);
    assert!(dead[0].reason.contains("evaluator unavailable"));

    let report = worker.run_once().await.expect("poll");
    assert!(report.is_empty());
    assert_eq!(evaluator.calls(), 3);

    let stats = store.stats(STREAM, GROUP).await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead_letters, 1);
}

#[tokio::test]
async fn test_over_budget_claim_dead_lettered_without_evaluation() {
    let (store, clock) = store_with_clock();
    append_events(&store, 1).await;

    // Three deliveries whose owners never reported back.
    for consumer in ["crashed-1", "crashed-2", "crashed-3"] {
        store
            .claim_batch(STREAM, GROUP, consumer, 1)
            .await
            .expect("claim");
        clock.advance(ORPHAN_TIMEOUT);
    }

    let evaluator = CountingEvaluator::succeeding();
    let (mut worker, _shutdown) = worker("worker-a", store.clone(), evaluator.clone(), 1, 2);

    let report = worker.run_once().await.expect("poll");

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(evaluator.calls(), 0);
    assert_eq!(store.dead_letters(STREAM, 10).await.expect("dead").len(), 1);
}

#[tokio::test]
async fn test_reclaimer_hands_orphan_to_other_worker() {
    let (store, clock) = store_with_clock();
    append_events(&store, 1).await;

    store
        .claim_batch(STREAM, GROUP, "crashed-worker", 1)
        .await
        .expect("claim");
    clock.advance(ORPHAN_TIMEOUT);

    let reclaimer = OrphanReclaimer::new(
        store.clone(),
        GROUP,
        ORPHAN_TIMEOUT,
        Duration::from_secs(1),
    );
    assert_eq!(
        reclaimer
            .reclaim_pass(STREAM, GROUP, ORPHAN_TIMEOUT)
            .await
            .expect("reclaim"),
        1
    );
    // A second pass finds nothing owned.
    assert_eq!(
        reclaimer
            .reclaim_pass(STREAM, GROUP, ORPHAN_TIMEOUT)
            .await
            .expect("reclaim"),
        0
    );

    let evaluator = CountingEvaluator::succeeding();
    let (mut worker, _shutdown) = worker("worker-b", store.clone(), evaluator.clone(), 5, 3);
    let report = worker.run_once().await.expect("poll");

    assert_eq!(report.acknowledged, 1);
    assert_eq!(evaluator.calls(), 1);
    assert_eq!(store.stats(STREAM, GROUP).await.expect("stats").pending, 0);
}

#[tokio::test]
async fn test_worker_round_robins_across_streams() {
    let (store, _clock) = store_with_clock();
    for project in ["ABC", "XYZ"] {
        for _ in 0..3 {
            store
                .append(
                    &format!("{}:{}", PREFIX, project),
                    &serde_json::json!({"project": project}),
                )
                .await
                .expect("append");
        }
    }

    let evaluator = CountingEvaluator::succeeding();
    let (mut worker, _shutdown) = worker("worker-a", store.clone(), evaluator.clone(), 2, 3);

    let mut total = 0;
    for _ in 0..3 {
        let report = worker.run_once().await.expect("poll");
        assert!(report.claimed <= 2);
        total += report.acknowledged;
    }
    for _ in 0..3 {
        total += worker.run_once().await.expect("poll").acknowledged;
    }

    assert_eq!(total, 6);
    assert_eq!(evaluator.calls(), 6);
}
