//! Redis Streams backend.
//!
//! # Key layout
//!
//! - `{prefix}:{PROJECT}`: one stream per Jira project, entries carry the
//!   fields `payload` (JSON) and `enqueued_at` (RFC 3339)
//! - `{prefix}:{PROJECT}:dead_letter`: dead letters, fields `envelope`,
//!   `reason`, `dead_lettered_at`
//! - `{prefix}:streams`: set of every project stream that was appended to
//!
//! # Claim protocol
//!
//! `claim_batch` first runs `XAUTOCLAIM` with the orphan timeout as minimum
//! idle time, following its cursor across the whole pending list, which
//! takes over lapsed and released entries. It then tops the batch up with
//! `XREADGROUP ... >`. A `NOGROUP` reply drops the cached group and recreates
//! it once. Released entries are parked on the
//! [`PARKED_CONSUMER`] with an idle time equal to the orphan timeout, so the
//! next `XAUTOCLAIM` picks them up straight away.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Value};
use tracing::warn;

use super::{DeadLetter, Envelope, MessageId, PendingEntry, StoreError, StreamStats, StreamStore};

/// Consumer name that holds released entries until someone claims them.
pub const PARKED_CONSUMER: &str = "__released__";

const FIELD_PAYLOAD: &str = "payload";
const FIELD_ENQUEUED_AT: &str = "enqueued_at";
const FIELD_ENVELOPE: &str = "envelope";
const FIELD_REASON: &str = "reason";
const FIELD_DEAD_LETTERED_AT: &str = "dead_lettered_at";

/// Cursor that starts an `XAUTOCLAIM` scan and marks its end.
const SCAN_START: &str = "0-0";

/// Upper bound on entries returned by one `XPENDING` scan.
const PENDING_SCAN_LIMIT: usize = 1000;

/// Acknowledges and records a dead letter in one step, but only if the entry
/// was still pending.
const DEAD_LETTER_SCRIPT: &str = r#"
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if acked == 1 then
  redis.call('XADD', KEYS[2], '*', 'envelope', ARGV[3], 'reason', ARGV[4], 'dead_lettered_at', ARGV[5])
end
return acked
"#;

/// Stream store backed by Redis Streams and consumer groups.
pub struct RedisStreamStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Prefix shared by every key this store writes.
    prefix: String,
    /// Minimum idle time before a claim can be taken over.
    orphan_timeout: Duration,
    /// `(stream, group)` pairs whose consumer group is known to exist.
    known_groups: Mutex<HashSet<(String, String)>>,
}

impl RedisStreamStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Prefix for the stream registry key
    /// * `orphan_timeout` - Idle time after which claims lapse
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        orphan_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix, orphan_timeout))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str, orphan_timeout: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            orphan_timeout,
            known_groups: Mutex::new(HashSet::new()),
        }
    }

    /// Key of the set listing every project stream.
    pub fn registry_key(&self) -> String {
        format!("{}:streams", self.prefix)
    }

    /// Key of the dead letter stream paired with `stream_key`.
    pub fn dead_letter_key(stream_key: &str) -> String {
        format!("{}:dead_letter", stream_key)
    }

    fn orphan_timeout_ms(&self) -> u64 {
        self.orphan_timeout.as_millis() as u64
    }

    /// Creates the consumer group (and the stream) on first use.
    async fn ensure_group(&self, stream_key: &str, group: &str) -> Result<(), StoreError> {
        let key = (stream_key.to_string(), group.to_string());
        if self.group_known(&key) {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        self.known_groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        Ok(())
    }

    fn group_known(&self, key: &(String, String)) -> bool {
        self.known_groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn forget_group(&self, stream_key: &str, group: &str) {
        self.known_groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(stream_key.to_string(), group.to_string()));
    }

    /// Takes over lapsed and released entries, following the `XAUTOCLAIM`
    /// cursor until `max_count` entries are found or the whole pending list
    /// was scanned.
    async fn autoclaim(
        &self,
        stream_key: &str,
        group: &str,
        consumer_id: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.redis.clone();
        let mut cursor = SCAN_START.to_string();
        let mut reclaimed = Vec::new();

        loop {
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(stream_key)
                .arg(group)
                .arg(consumer_id)
                .arg(self.orphan_timeout_ms())
                .arg(&cursor)
                .arg("COUNT")
                .arg(max_count - reclaimed.len())
                .query_async(&mut conn)
                .await?;

            let parts = as_bulk(&reply)?;
            if let Some(entries) = parts.get(1) {
                for entry in as_bulk(entries)? {
                    if let Some(entry) = parse_entry(entry)? {
                        reclaimed.push(entry);
                    }
                }
            }

            let next = match parts.first() {
                Some(next) => as_string(next)?,
                None => SCAN_START.to_string(),
            };
            if reclaimed.len() >= max_count || next == SCAN_START {
                return Ok(reclaimed);
            }
            cursor = next;
        }
    }

    async fn claim_from_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer_id: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let reclaimed = self
            .autoclaim(stream_key, group, consumer_id, max_count)
            .await?;

        let reclaimed_ids: Vec<String> = reclaimed.iter().map(|e| e.id.clone()).collect();
        let counts = self.delivery_counts(stream_key, group, &reclaimed_ids).await?;

        let mut batch = Vec::with_capacity(max_count);
        for entry in reclaimed {
            let delivery_count = counts.get(&entry.id).copied().unwrap_or(1);
            batch.push(entry.into_envelope(stream_key, delivery_count)?);
        }

        // Never-delivered entries.
        let remaining = max_count.saturating_sub(batch.len());
        if remaining > 0 {
            let mut conn = self.redis.clone();
            let reply: Value = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer_id)
                .arg("COUNT")
                .arg(remaining)
                .arg("STREAMS")
                .arg(stream_key)
                .arg(">")
                .query_async(&mut conn)
                .await?;

            for stream in as_bulk(&reply)? {
                let stream_parts = as_bulk(stream)?;
                let Some(entries) = stream_parts.get(1) else {
                    continue;
                };
                for entry in as_bulk(entries)? {
                    if let Some(entry) = parse_entry(entry)? {
                        batch.push(entry.into_envelope(stream_key, 1)?);
                    }
                }
            }
        }

        Ok(batch)
    }

    /// Owned pending entries idle for at least `older_than`.
    async fn scan_pending(
        &self,
        stream_key: &str,
        group: &str,
        older_than: Duration,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.redis.clone();

        let reply: Value = redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(group)
            .arg("IDLE")
            .arg(older_than.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN_LIMIT)
            .query_async(&mut conn)
            .await?;

        let now = Utc::now();
        let mut entries = Vec::new();
        for row in as_bulk(&reply)? {
            let pending = parse_pending_row(row)?;
            if pending.consumer == PARKED_CONSUMER {
                continue;
            }
            let idle = chrono::Duration::milliseconds(pending.idle_ms);
            entries.push(PendingEntry {
                stream_key: stream_key.to_string(),
                message_id: MessageId::new(pending.id),
                consumer_id: pending.consumer,
                claimed_at: now - idle,
                delivery_count: pending.deliveries,
            });
        }
        Ok(entries)
    }

    /// Reads the delivery counters of freshly autoclaimed entries.
    async fn delivery_counts(
        &self,
        stream_key: &str,
        group: &str,
        ids: &[String],
    ) -> Result<HashMap<String, u32>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("XPENDING")
                .arg(stream_key)
                .arg(group)
                .arg(id)
                .arg(id)
                .arg(1);
        }

        let mut conn = self.redis.clone();
        let replies: Vec<Value> = pipe.query_async(&mut conn).await?;

        let mut counts = HashMap::new();
        for reply in &replies {
            for row in as_bulk(reply)? {
                let pending = parse_pending_row(row)?;
                counts.insert(pending.id, pending.deliveries);
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(
        &self,
        stream_key: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageId, StoreError> {
        let serialized = serde_json::to_string(payload)?;
        let enqueued_at = Utc::now().to_rfc3339();
        let mut conn = self.redis.clone();

        // Registering the stream and appending must not be split.
        let (id,): (String,) = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(stream_key)
            .arg("*")
            .arg(FIELD_PAYLOAD)
            .arg(serialized)
            .arg(FIELD_ENQUEUED_AT)
            .arg(enqueued_at)
            .cmd("SADD")
            .arg(self.registry_key())
            .arg(stream_key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(MessageId::new(id))
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
        self.ensure_group(stream_key, group).await?;

        match self.claim_from_group(stream_key, group, consumer_id, max_count).await {
            Err(StoreError::Redis(e)) if is_missing_group(&e) => {
                warn!(stream = %stream_key, group, "Consumer group vanished, recreating it");
                self.forget_group(stream_key, group);
                self.ensure_group(stream_key, group).await?;
                self.claim_from_group(stream_key, group, consumer_id, max_count)
                    .await
            }
            result => result,
        }
    }

    async fn acknowledge(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &MessageId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream_key)
            .arg(group)
            .arg(message_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(acked == 1)
    }

    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        older_than: Duration,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        self.ensure_group(stream_key, group).await?;

        match self.scan_pending(stream_key, group, older_than).await {
            Err(StoreError::Redis(e)) if is_missing_group(&e) => {
                warn!(stream = %stream_key, group, "Consumer group vanished, recreating it");
                self.forget_group(stream_key, group);
                self.ensure_group(stream_key, group).await?;
                self.scan_pending(stream_key, group, older_than).await
            }
            result => result,
        }
    }

    async fn release(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &MessageId,
        older_than: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let parked_idle = self.orphan_timeout.max(older_than).as_millis() as u64;

        // XCLAIM re-checks the idle time atomically; JUSTID leaves the
        // delivery counter alone.
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(stream_key)
            .arg(group)
            .arg(PARKED_CONSUMER)
            .arg(older_than.as_millis() as u64)
            .arg(message_id.as_str())
            .arg("IDLE")
            .arg(parked_idle)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        Ok(!claimed.is_empty())
    }

    async fn dead_letter(
        &self,
        group: &str,
        envelope: &Envelope,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let serialized = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();

        let acked: i64 = redis::Script::new(DEAD_LETTER_SCRIPT)
            .key(&envelope.stream_key)
            .key(Self::dead_letter_key(&envelope.stream_key))
            .arg(group)
            .arg(envelope.id.as_str())
            .arg(serialized)
            .arg(reason)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        Ok(acked == 1)
    }

    async fn dead_letters(
        &self,
        stream_key: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();

        let reply: Value = redis::cmd("XREVRANGE")
            .arg(Self::dead_letter_key(stream_key))
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut letters = Vec::new();
        for entry in as_bulk(&reply)? {
            let Some(entry) = parse_entry(entry)? else {
                continue;
            };
            letters.push(entry.into_dead_letter()?);
        }
        Ok(letters)
    }

    async fn streams(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut streams: Vec<String> = conn.smembers(self.registry_key()).await?;
        streams.sort();
        Ok(streams)
    }

    async fn stats(&self, stream_key: &str, group: &str) -> Result<StreamStats, StoreError> {
        self.ensure_group(stream_key, group).await?;
        let mut conn = self.redis.clone();

        let (length, summary, dead_letters): (usize, Value, usize) = redis::pipe()
            .cmd("XLEN")
            .arg(stream_key)
            .cmd("XPENDING")
            .arg(stream_key)
            .arg(group)
            .cmd("XLEN")
            .arg(Self::dead_letter_key(stream_key))
            .query_async(&mut conn)
            .await?;

        let pending = match as_bulk(&summary)?.first() {
            Some(count) => as_int(count)? as usize,
            None => 0,
        };

        Ok(StreamStats {
            stream_key: stream_key.to_string(),
            length,
            pending,
            dead_letters,
        })
    }
}

/// One stream entry as returned by `XREADGROUP`, `XAUTOCLAIM` or `XRANGE`.
#[derive(Debug)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl StreamEntry {
    fn field(&self, name: &str) -> Result<&str, StoreError> {
        self.fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::UnexpectedReply(format!("entry {} lacks '{}'", self.id, name)))
    }

    fn into_envelope(self, stream_key: &str, delivery_count: u32) -> Result<Envelope, StoreError> {
        let payload = serde_json::from_str(self.field(FIELD_PAYLOAD)?)?;
        let enqueued_at = self
            .fields
            .get(FIELD_ENQUEUED_AT)
            .and_then(|raw| parse_timestamp(raw))
            .or_else(|| timestamp_from_id(&self.id))
            .unwrap_or_else(Utc::now);

        Ok(Envelope {
            stream_key: stream_key.to_string(),
            id: MessageId::new(self.id),
            payload,
            enqueued_at,
            delivery_count,
        })
    }

    fn into_dead_letter(self) -> Result<DeadLetter, StoreError> {
        let envelope: Envelope = serde_json::from_str(self.field(FIELD_ENVELOPE)?)?;
        let reason = self.field(FIELD_REASON)?.to_string();
        let dead_lettered_at = self
            .fields
            .get(FIELD_DEAD_LETTERED_AT)
            .and_then(|raw| parse_timestamp(raw))
            .or_else(|| timestamp_from_id(&self.id))
            .unwrap_or_else(Utc::now);

        Ok(DeadLetter {
            envelope,
            reason,
            dead_lettered_at,
        })
    }
}

/// One row of the extended `XPENDING` reply.
#[derive(Debug)]
struct PendingRow {
    id: String,
    consumer: String,
    idle_ms: i64,
    deliveries: u32,
}

/// The consumer group (or its stream) was deleted behind our back.
fn is_missing_group(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP")
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Redis entry ids start with the append time in milliseconds.
fn timestamp_from_id(id: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = id.split('-').next()?.parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn as_bulk(value: &Value) -> Result<&[Value], StoreError> {
    match value {
        Value::Bulk(items) => Ok(items),
        Value::Nil => Ok(&[]),
        other => Err(StoreError::UnexpectedReply(format!(
            "expected array, got {:?}",
            other
        ))),
    }
}

fn as_string(value: &Value) -> Result<String, StoreError> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| StoreError::UnexpectedReply(e.to_string())),
        Value::Status(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        other => Err(StoreError::UnexpectedReply(format!(
            "expected string, got {:?}",
            other
        ))),
    }
}

fn as_int(value: &Value) -> Result<i64, StoreError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => as_string(other)?
            .parse()
            .map_err(|_| StoreError::UnexpectedReply(format!("expected integer, got {:?}", other))),
    }
}

/// Parses `[id, [field, value, ...]]`. Entries deleted from the stream come
/// back as nil and yield `None`.
fn parse_entry(value: &Value) -> Result<Option<StreamEntry>, StoreError> {
    let parts = as_bulk(value)?;
    let (Some(id), Some(fields)) = (parts.first(), parts.get(1)) else {
        return Ok(None);
    };
    if matches!(fields, Value::Nil) {
        return Ok(None);
    }

    let flat = as_bulk(fields)?;
    let mut map = HashMap::with_capacity(flat.len() / 2);
    for pair in flat.chunks(2) {
        if let [name, value] = pair {
            map.insert(as_string(name)?, as_string(value)?);
        }
    }

    Ok(Some(StreamEntry {
        id: as_string(id)?,
        fields: map,
    }))
}

/// Parses `[id, consumer, idle_ms, deliveries]`.
fn parse_pending_row(value: &Value) -> Result<PendingRow, StoreError> {
    match as_bulk(value)? {
        [id, consumer, idle, deliveries] => Ok(PendingRow {
            id: as_string(id)?,
            consumer: as_string(consumer)?,
            idle_ms: as_int(idle)?,
            deliveries: as_int(deliveries)?.max(0) as u32,
        }),
        other => Err(StoreError::UnexpectedReply(format!(
            "malformed XPENDING row: {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_entry() {
        let value = Value::Bulk(vec![
            data("1700000000000-0"),
            Value::Bulk(vec![
                data(FIELD_PAYLOAD),
                data(r#"{"issue_key":"ABC-1"}"#),
                data(FIELD_ENQUEUED_AT),
                data("2024-01-15T12:00:00+00:00"),
            ]),
        ]);

        let entry = parse_entry(&value).expect("parse").expect("present");
        assert_eq!(entry.id, "1700000000000-0");

        let envelope = entry
            .into_envelope("dacrew:jira:ABC", 2)
            .expect("envelope");
        assert_eq!(envelope.delivery_count, 2);
        assert_eq!(envelope.payload["issue_key"], "ABC-1");
        assert_eq!(envelope.enqueued_at.to_rfc3339(), "2024-01-15T12:00:00+00:00");
    }

    #[test]
    fn test_parse_deleted_entry() {
        let value = Value::Bulk(vec![data("1-0"), Value::Nil]);
        assert!(parse_entry(&value).expect("parse").is_none());
    }

    #[test]
    fn test_parse_pending_row() {
        let value = Value::Bulk(vec![
            data("1-0"),
            data("worker-1"),
            Value::Int(61_000),
            Value::Int(3),
        ]);

        let row = parse_pending_row(&value).expect("row");
        assert_eq!(row.id, "1-0");
        assert_eq!(row.consumer, "worker-1");
        assert_eq!(row.idle_ms, 61_000);
        assert_eq!(row.deliveries, 3);
    }

    #[test]
    fn test_parse_pending_row_rejects_short_rows() {
        let value = Value::Bulk(vec![data("1-0")]);
        assert!(matches!(
            parse_pending_row(&value),
            Err(StoreError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_timestamp_from_id() {
        let ts = timestamp_from_id("1700000000000-5").expect("timestamp");
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
        assert!(timestamp_from_id("garbage").is_none());
    }

    #[test]
    fn test_envelope_without_payload_is_rejected() {
        let entry = StreamEntry {
            id: "1-0".to_string(),
            fields: HashMap::new(),
        };
        assert!(matches!(
            entry.into_envelope("s", 1),
            Err(StoreError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_missing_group_detection() {
        let missing = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "NOGROUP",
            "No such key 'dacrew:jira:ABC' or consumer group 'workers'".to_string(),
        ));
        assert!(is_missing_group(&missing));

        let other = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "WRONGTYPE",
            "Operation against a key holding the wrong kind of value".to_string(),
        ));
        assert!(!is_missing_group(&other));
    }

    #[test]
    fn test_dead_letter_key() {
        assert_eq!(
            RedisStreamStore::dead_letter_key("dacrew:jira:ABC"),
            "dacrew:jira:ABC:dead_letter"
        );
    }
}
