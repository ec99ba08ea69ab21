//! In-process stream store.
//!
//! All streams live behind one mutex, so every operation is linearizable and
//! claims are trivially exclusive. State does not survive the process; use it
//! for tests and for running ingestion and workers together in one binary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DeadLetter, Envelope, MessageId, PendingEntry, StoreError, StreamStats, StreamStore};
use crate::clock::{elapsed_between, Clock, SystemClock};

/// Stream store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStreamStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    orphan_timeout: Duration,
}

#[derive(Debug, Default)]
struct StoreState {
    streams: BTreeMap<String, StreamLog>,
}

#[derive(Debug, Default)]
struct StreamLog {
    last_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
    groups: HashMap<String, GroupCursor>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GroupCursor {
    /// Highest sequence ever handed to this group.
    last_delivered: u64,
    pending: BTreeMap<u64, Claim>,
}

#[derive(Debug, Clone)]
struct Claim {
    /// `None` once the reclaimer has released the entry.
    owner: Option<String>,
    claimed_at: DateTime<Utc>,
    delivery_count: u32,
}

impl Claim {
    fn claimable(&self, now: DateTime<Utc>, orphan_timeout: Duration) -> bool {
        self.owner.is_none() || elapsed_between(self.claimed_at, now) >= orphan_timeout
    }
}

impl MemoryStreamStore {
    /// Creates an empty store reading the system clock.
    pub fn new(orphan_timeout: Duration) -> Self {
        Self::with_clock(orphan_timeout, Arc::new(SystemClock))
    }

    /// Creates an empty store reading `clock`.
    pub fn with_clock(orphan_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            orphan_timeout,
        }
    }

    /// The idle time after which a claim may be taken over.
    pub fn orphan_timeout(&self) -> Duration {
        self.orphan_timeout
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_sequence(id: &MessageId) -> Option<u64> {
    id.as_str().parse().ok()
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(
        &self,
        stream_key: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageId, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let log = state.streams.entry(stream_key.to_string()).or_default();

        log.last_sequence += 1;
        let sequence = log.last_sequence;
        log.messages.insert(
            sequence,
            StoredMessage {
                payload: payload.clone(),
                enqueued_at: now,
            },
        );

        Ok(MessageId::from_sequence(sequence))
    }

    async fn claim_batch(
        &self,
        stream_key: &str,
        group: &str,
        consumer_id: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut state = self.lock();
        let Some(log) = state.streams.get_mut(stream_key) else {
            return Ok(Vec::new());
        };
        let cursor = log.groups.entry(group.to_string()).or_default();

        // Released or lapsed claims first, oldest message first.
        let mut selected: Vec<u64> = cursor
            .pending
            .iter()
            .filter(|(_, claim)| claim.claimable(now, self.orphan_timeout))
            .map(|(sequence, _)| *sequence)
            .take(max_count)
            .collect();

        // Then messages this group has never seen.
        let remaining = max_count - selected.len();
        let fresh: Vec<u64> = log
            .messages
            .range(cursor.last_delivered + 1..)
            .map(|(sequence, _)| *sequence)
            .take(remaining)
            .collect();
        if let Some(last) = fresh.last() {
            cursor.last_delivered = *last;
        }
        selected.extend(fresh);

        let mut batch = Vec::with_capacity(selected.len());
        for sequence in selected {
            let Some(message) = log.messages.get(&sequence) else {
                // Payload gone; drop the orphaned claim rather than loop on it.
                cursor.pending.remove(&sequence);
                continue;
            };

            let claim = cursor.pending.entry(sequence).or_insert(Claim {
                owner: None,
                claimed_at: now,
                delivery_count: 0,
            });
            claim.owner = Some(consumer_id.to_string());
            claim.claimed_at = now;
            claim.delivery_count += 1;

            batch.push(Envelope {
                stream_key: stream_key.to_string(),
                id: MessageId::from_sequence(sequence),
                payload: message.payload.clone(),
                enqueued_at: message.enqueued_at,
                delivery_count: claim.delivery_count,
            });
        }

        Ok(batch)
    }

    async fn acknowledge(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &MessageId,
    ) -> Result<bool, StoreError> {
        let Some(sequence) = parse_sequence(message_id) else {
            return Ok(false);
        };

        let mut state = self.lock();
        let removed = state
            .streams
            .get_mut(stream_key)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|cursor| cursor.pending.remove(&sequence))
            .is_some();

        Ok(removed)
    }

    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        older_than: Duration,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let now = self.clock.now();
        let state = self.lock();
        let Some(cursor) = state
            .streams
            .get(stream_key)
            .and_then(|log| log.groups.get(group))
        else {
            return Ok(Vec::new());
        };

        let entries = cursor
            .pending
            .iter()
            .filter_map(|(sequence, claim)| {
                let owner = claim.owner.as_ref()?;
                let entry = PendingEntry {
                    stream_key: stream_key.to_string(),
                    message_id: MessageId::from_sequence(*sequence),
                    consumer_id: owner.clone(),
                    claimed_at: claim.claimed_at,
                    delivery_count: claim.delivery_count,
                };
                entry.is_orphaned(now, older_than).then_some(entry)
            })
            .collect();

        Ok(entries)
    }

    async fn release(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &MessageId,
        older_than: Duration,
    ) -> Result<bool, StoreError> {
        let Some(sequence) = parse_sequence(message_id) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let mut state = self.lock();
        let Some(claim) = state
            .streams
            .get_mut(stream_key)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|cursor| cursor.pending.get_mut(&sequence))
        else {
            return Ok(false);
        };

        if claim.owner.is_none() || elapsed_between(claim.claimed_at, now) < older_than {
            return Ok(false);
        }

        claim.owner = None;
        Ok(true)
    }

    async fn dead_letter(
        &self,
        group: &str,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let Some(sequence) = parse_sequence(&envelope.id) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let mut state = self.lock();
        let Some(log) = state.streams.get_mut(&envelope.stream_key) else {
            return Ok(false);
        };

        let removed = log
            .groups
            .get_mut(group)
            .and_then(|cursor| cursor.pending.remove(&sequence))
            .is_some();
        if removed {
            log.dead_letters.push(DeadLetter {
                envelope: envelope.clone(),
                reason: reason.to_string(),
                dead_lettered_at: now,
            });
        }

        Ok(removed)
    }

    async fn dead_letters(
        &self,
        stream_key: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.lock();
        let letters = state
            .streams
            .get(stream_key)
            .map(|log| log.dead_letters.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(letters)
    }

    async fn streams(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().streams.keys().cloned().collect())
    }

    async fn stats(&self, stream_key: &str, group: &str) -> Result<StreamStats, StoreError> {
        let state = self.lock();
        let Some(log) = state.streams.get(stream_key) else {
            return Ok(StreamStats {
                stream_key: stream_key.to_string(),
                ..StreamStats::default()
            });
        };

        Ok(StreamStats {
            stream_key: stream_key.to_string(),
            length: log.messages.len(),
            pending: log.groups.get(group).map_or(0, |c| c.pending.len()),
            dead_letters: log.dead_letters.len(),
        })
    }
}
