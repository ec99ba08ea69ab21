//! Webhook ingestion: verify, normalize, append.
//!
//! [`Producer::ingest`] is the only way messages enter the queue. It appends
//! exactly once per accepted request and never retries; Jira redelivers on
//! failure and downstream processing is expected to be idempotent.

pub mod server;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::metrics::MetricsCollector;
use crate::stream::{MessageId, StreamStore};
use crate::webhook::{verify_signature, JiraEvent};

pub use server::{router, serve, AppState};

/// Stream key of a project: `{prefix}:{project_key}`.
pub fn stream_key_for(prefix: &str, project_key: &str) -> String {
    format!("{}:{}", prefix, project_key)
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Identifier assigned by the store.
    pub message_id: MessageId,
    /// Stream the event was appended to.
    pub stream_key: String,
    /// Work identifier of the event.
    pub work_id: String,
}

/// Accepts signed webhooks into the durable stream store.
pub struct Producer {
    store: Arc<dyn StreamStore>,
    secret: Vec<u8>,
    stream_prefix: String,
    metrics: MetricsCollector,
}

impl Producer {
    /// Creates a producer.
    ///
    /// An empty `secret` makes every request fail verification.
    pub fn new(
        store: Arc<dyn StreamStore>,
        secret: impl Into<Vec<u8>>,
        stream_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            secret: secret.into(),
            stream_prefix: stream_prefix.into(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Verifies, parses and appends one webhook body.
    ///
    /// # Errors
    ///
    /// - `IngestError::Unauthorized` if the signature is missing or wrong
    /// - `IngestError::MalformedPayload` if the body is not a Jira event
    /// - `IngestError::StoreUnavailable` if the append failed
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<MessageId, IngestError> {
        self.accept(raw_body, signature)
            .await
            .map(|accepted| accepted.message_id)
    }

    /// Like [`Producer::ingest`], also reporting the stream and work id.
    pub async fn accept(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<Accepted, IngestError> {
        let result = self.try_accept(raw_body, signature).await;

        match &result {
            Ok(accepted) => {
                self.metrics.record_ingest("accepted");
                info!(
                    message_id = %accepted.message_id,
                    stream = %accepted.stream_key,
                    work_id = %accepted.work_id,
                    "Webhook enqueued"
                );
            }
            Err(e) => {
                self.metrics.record_ingest(e.outcome());
                if matches!(e, IngestError::StoreUnavailable(_)) {
                    self.metrics.record_store_error("append");
                }
                warn!(outcome = e.outcome(), error = %e, "Webhook rejected");
            }
        }

        result
    }

    async fn try_accept(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<Accepted, IngestError> {
        if !verify_signature(raw_body, signature, &self.secret) {
            return Err(IngestError::Unauthorized);
        }

        let event = JiraEvent::parse(raw_body)?;
        debug!(
            issue = %event.issue_key,
            project = %event.project_key,
            event = %event.event,
            "Webhook validated"
        );

        let stream_key = stream_key_for(&self.stream_prefix, &event.project_key);
        let payload = serde_json::to_value(&event)
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;

        let message_id = self.store.append(&stream_key, &payload).await?;

        Ok(Accepted {
            message_id,
            stream_key,
            work_id: event.work_id,
        })
    }

    /// The store this producer appends to.
    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }
}
