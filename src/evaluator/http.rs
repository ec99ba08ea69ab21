//! Evaluator that forwards work items to an external agent service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::IssueEvaluator;
use crate::error::EvaluationError;
use crate::stream::Envelope;

/// Header carrying the message id, usable as an idempotency key.
pub const MESSAGE_ID_HEADER: &str = "X-Dacrew-Message-Id";

/// Longest error body kept in an [`EvaluationError::Rejected`].
const MAX_ERROR_BODY: usize = 512;

/// JSON body posted to the agent service.
#[derive(Debug, Serialize)]
pub struct EvaluationRequest<'a> {
    pub message_id: &'a str,
    pub stream: &'a str,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub work: &'a serde_json::Value,
}

impl<'a> From<&'a Envelope> for EvaluationRequest<'a> {
    fn from(envelope: &'a Envelope) -> Self {
        Self {
            message_id: envelope.id.as_str(),
            stream: &envelope.stream_key,
            delivery_count: envelope.delivery_count,
            enqueued_at: envelope.enqueued_at,
            work: &envelope.payload,
        }
    }
}

/// POSTs each envelope to a configured URL. Any 2xx answer is success.
pub struct HttpEvaluator {
    url: String,
    http_client: Client,
}

impl HttpEvaluator {
    /// Creates an evaluator posting to `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `EvaluationError::RequestFailed` if the HTTP client cannot be
    /// built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EvaluationError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IssueEvaluator for HttpEvaluator {
    async fn process(&self, envelope: &Envelope) -> Result<(), EvaluationError> {
        let request = EvaluationRequest::from(envelope);

        let response = self
            .http_client
            .post(&self.url)
            .header(MESSAGE_ID_HEADER, envelope.id.as_str())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(message_id = %envelope.id, status = status.as_u16(), "Evaluator accepted work item");
            return Ok(());
        }

        let mut body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        Err(EvaluationError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
