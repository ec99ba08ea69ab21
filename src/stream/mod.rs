//! Durable stream store with consumer-group semantics.
//!
//! Every accepted webhook becomes an [`Envelope`] appended to the stream of its
//! Jira project. Workers in a consumer group compete for envelopes through
//! [`StreamStore::claim_batch`]; a claimed envelope is tracked as a
//! [`PendingEntry`] until it is acknowledged or dead-lettered.
//!
//! # Backends
//!
//! - [`RedisStreamStore`]: Redis Streams (`XADD`, `XREADGROUP`, `XAUTOCLAIM`,
//!   `XACK`). Shared by any number of processes.
//! - [`MemoryStreamStore`]: a single mutex-guarded log for tests and
//!   single-process development.
//!
//! # Delivery model
//!
//! ```text
//!   append ──► [new] ──claim──► [pending: consumer A, count n]
//!                                   │          │           │
//!                               acknowledge  expires    dead_letter
//!                                   │          │           │
//!                                retired   claim again   [dead letters]
//!                                         (count n + 1)
//! ```
//!
//! A pending entry becomes claimable again once it has been idle for at least
//! the store's orphan timeout, or once the orphan reclaimer has released it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::elapsed_between;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStreamStore;
pub use self::redis::RedisStreamStore;

/// URL scheme selecting the in-memory backend.
pub const MEMORY_STORE_URL: &str = "memory://";

/// Errors raised by stream store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Stream store unavailable: {0}")]
    Unavailable(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Failed to encode or decode stored data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend answered with something we cannot interpret.
    #[error("Unexpected reply from stream store: {0}")]
    UnexpectedReply(String),

    /// The store URL uses a scheme no backend understands.
    #[error("Unsupported stream store URL: {0}")]
    UnsupportedUrl(String),
}

impl StoreError {
    /// Returns whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
                    || e.is_connection_refusal()
            }
            StoreError::Serialization(_)
            | StoreError::UnexpectedReply(_)
            | StoreError::UnsupportedUrl(_) => false,
        }
    }
}

/// Store-assigned identifier of a message, unique within its stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a backend identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the identifier of the `sequence`-th message of a stream.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(sequence.to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A message as handed to a consumer.
///
/// Everything but `delivery_count` is fixed at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Stream the message was appended to.
    pub stream_key: String,
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Validated webhook content.
    pub payload: serde_json::Value,
    /// When the producer appended the message.
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the message has been claimed, including this claim.
    pub delivery_count: u32,
}

/// An in-flight claim on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Stream holding the message.
    pub stream_key: String,
    /// Claimed message.
    pub message_id: MessageId,
    /// Consumer currently owning the claim.
    pub consumer_id: String,
    /// When the current claim was made.
    pub claimed_at: DateTime<Utc>,
    /// Number of claims so far.
    pub delivery_count: u32,
}

impl PendingEntry {
    /// How long the entry has gone without being acknowledged.
    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.claimed_at, now)
    }

    /// Whether the claim has lapsed under `orphan_timeout`.
    pub fn is_orphaned(&self, now: DateTime<Utc>, orphan_timeout: Duration) -> bool {
        self.idle(now) >= orphan_timeout
    }
}

/// A message that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The envelope as of its final delivery.
    pub envelope: Envelope,
    /// Final failure description.
    pub reason: String,
    /// When the message was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time counters for one stream and consumer group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Stream the counters describe.
    pub stream_key: String,
    /// Messages in the log, acknowledged or not.
    pub length: usize,
    /// Messages currently claimed (or released) and not yet acknowledged.
    pub pending: usize,
    /// Messages in the dead letter record.
    pub dead_letters: usize,
}

/// Durable, replayable log with competing-consumer primitives.
///
/// Every mutating operation is atomic in the backing store; workers share no
/// other state.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Appends `payload` to `stream_key` and returns its new identifier.
    async fn append(
        &self,
        stream_key: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageId, StoreError>;

    /// Claims up to `max_count` messages for `consumer_id`.
    ///
    /// Released and orphaned entries are handed out before never-claimed
    /// messages. Each returned envelope carries its incremented delivery
    /// count. Concurrent callers never receive the same message.
    async fn claim_batch(
        &self,
        stream_key: &str,
        group: &str,
        consumer_id: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, StoreError>;

    /// Retires a pending entry. Returns `false` when there is nothing to
    /// acknowledge, which callers treat as a benign race.
    async fn acknowledge(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &MessageId,
    ) -> Result<bool, StoreError>;

    /// Lists owned pending entries idle for at least `older_than`.
    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        older_than: Duration,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Clears ownership of a pending entry if it is still pending and still
    /// idle for at least `older_than`.
    async fn release(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &MessageId,
        older_than: Duration,
    ) -> Result<bool, StoreError>;

    /// Removes the envelope's pending entry and records it as a dead letter.
    /// Returns `false`, recording nothing, when the entry is no longer pending.
    async fn dead_letter(
        &self,
        group: &str,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Most recent dead letters of a stream, newest first.
    async fn dead_letters(
        &self,
        stream_key: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    /// Every stream that has received at least one message.
    async fn streams(&self) -> Result<Vec<String>, StoreError>;

    /// Counters for one stream and group.
    async fn stats(&self, stream_key: &str, group: &str) -> Result<StreamStats, StoreError>;
}

/// Opens the backend selected by `url`.
///
/// `memory://` yields a fresh [`MemoryStreamStore`]; `redis://` and
/// `rediss://` connect a [`RedisStreamStore`] whose stream registry lives
/// under `prefix`.
pub async fn open_store(
    url: &str,
    prefix: &str,
    orphan_timeout: Duration,
) -> Result<Arc<dyn StreamStore>, StoreError> {
    if url == MEMORY_STORE_URL {
        return Ok(Arc::new(MemoryStreamStore::new(orphan_timeout)));
    }

    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisStreamStore::connect(url, prefix, orphan_timeout).await?;
        return Ok(Arc::new(store));
    }

    Err(StoreError::UnsupportedUrl(url.to_string()))
}
