//! Integration tests for the Redis Streams backend.
//!
//! These tests need a running Redis server.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_store -- --ignored

use std::time::Duration;

use dacrew::stream::{RedisStreamStore, StreamStore};
use uuid::Uuid;

const GROUP: &str = "dacrew_test_consumers";
const ORPHAN_TIMEOUT: Duration = Duration::from_millis(300);

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn connect() -> (RedisStreamStore, String) {
    let url = redis_url();
    let prefix = format!("dacrew-test:{}", Uuid::new_v4().simple());
    let store = RedisStreamStore::connect(&url, &prefix, ORPHAN_TIMEOUT)
        .await
        .expect("Redis must be reachable for integration tests");
    let stream = format!("{}:ABC", prefix);
    (store, stream)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_store -- --ignored
async fn test_append_claim_acknowledge() {
    let (store, stream) = connect().await;

    let id = store
        .append(&stream, &serde_json::json!({"issue_key": "ABC-1"}))
        .await
        .expect("append");

    let claimed = store
        .claim_batch(&stream, GROUP, "worker-a", 10)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].delivery_count, 1);
    assert_eq!(claimed[0].payload["issue_key"], "ABC-1");

    assert!(store.acknowledge(&stream, GROUP, &id).await.expect("ack"));
    assert!(!store.acknowledge(&stream, GROUP, &id).await.expect("ack"));

    assert_eq!(store.streams().await.expect("streams"), vec![stream.clone()]);
}

#[tokio::test]
#[ignore]
async fn test_expired_claim_is_redelivered() {
    let (store, stream) = connect().await;
    store
        .append(&stream, &serde_json::json!({"issue_key": "ABC-1"}))
        .await
        .expect("append");

    store
        .claim_batch(&stream, GROUP, "crashed-worker", 1)
        .await
        .expect("claim");
    assert!(store
        .claim_batch(&stream, GROUP, "worker-b", 1)
        .await
        .expect("claim")
        .is_empty());

    tokio::time::sleep(ORPHAN_TIMEOUT + Duration::from_millis(100)).await;

    let reclaimed = store
        .claim_batch(&stream, GROUP, "worker-b", 1)
        .await
        .expect("claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].delivery_count, 2);
}

#[tokio::test]
#[ignore]
async fn test_release_and_dead_letter() {
    let (store, stream) = connect().await;
    let id = store
        .append(&stream, &serde_json::json!({"issue_key": "ABC-1"}))
        .await
        .expect("append");
    store
        .claim_batch(&stream, GROUP, "crashed-worker", 1)
        .await
        .expect("claim");

    tokio::time::sleep(ORPHAN_TIMEOUT + Duration::from_millis(100)).await;

    let orphans = store
        .pending_entries(&stream, GROUP, ORPHAN_TIMEOUT)
        .await
        .expect("pending");
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].consumer_id, "crashed-worker");
    assert!(store
        .release(&stream, GROUP, &id, ORPHAN_TIMEOUT)
        .await
        .expect("release"));

    let claimed = store
        .claim_batch(&stream, GROUP, "worker-b", 1)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    assert!(store
        .dead_letter(GROUP, &claimed[0], "gave up")
        .await
        .expect("dead letter"));
    assert!(!store
        .dead_letter(GROUP, &claimed[0], "gave up")
        .await
        .expect("dead letter"));

    let dead = store.dead_letters(&stream, 10).await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.id, id);
    assert_eq!(dead[0].reason, "gave up");

    let stats = store.stats(&stream, GROUP).await.expect("stats");
    assert_eq!(stats.length, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead_letters, 1);
}

#[tokio::test]
#[ignore]
async fn test_lapsed_entry_behind_busy_claims_is_reclaimed() {
    let (store, stream) = connect().await;
    let mut ids = Vec::new();
    for n in 0..12 {
        let id = store
            .append(&stream, &serde_json::json!({"n": n}))
            .await
            .expect("append");
        ids.push(id);
    }

    store
        .claim_batch(&stream, GROUP, "crashed-worker", 12)
        .await
        .expect("claim");
    tokio::time::sleep(ORPHAN_TIMEOUT + Duration::from_millis(100)).await;

    // The first eleven are taken over and are busy again; only the last
    // entry stays lapsed, far behind them in the pending list.
    let busy = store
        .claim_batch(&stream, GROUP, "busy-worker", 11)
        .await
        .expect("claim");
    assert_eq!(busy.len(), 11);

    let reclaimed = store
        .claim_batch(&stream, GROUP, "worker-b", 1)
        .await
        .expect("claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, ids[11]);
    assert_eq!(reclaimed[0].delivery_count, 2);
}

#[tokio::test]
#[ignore]
async fn test_group_is_recreated_after_stream_deletion() {
    let (store, stream) = connect().await;
    store
        .append(&stream, &serde_json::json!({"issue_key": "ABC-1"}))
        .await
        .expect("append");
    store
        .claim_batch(&stream, GROUP, "worker-a", 1)
        .await
        .expect("claim");

    let client = redis::Client::open(redis_url()).expect("client");
    let mut conn = redis::aio::ConnectionManager::new(client)
        .await
        .expect("connection");
    let _: i64 = redis::cmd("DEL")
        .arg(&stream)
        .query_async(&mut conn)
        .await
        .expect("delete stream");

    let id = store
        .append(&stream, &serde_json::json!({"issue_key": "ABC-2"}))
        .await
        .expect("append");
    let claimed = store
        .claim_batch(&stream, GROUP, "worker-a", 1)
        .await
        .expect("claim after deletion");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].payload["issue_key"], "ABC-2");
}
