//! Error types for dacrew operations.
//!
//! Defines the error taxonomy of the two halves of the queue:
//! - Ingestion (signature, payload, store availability)
//! - Evaluation of a single queued message
//!
//! Store and pool errors live next to their subsystems
//! ([`crate::stream::StoreError`], [`crate::worker::PoolError`]).

use std::time::Duration;

use thiserror::Error;

use crate::stream::StoreError;
use crate::webhook::EventParseError;

/// Errors that can occur while accepting a webhook.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Webhook signature missing or invalid")]
    Unauthorized,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Stream store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl From<EventParseError> for IngestError {
    fn from(err: EventParseError) -> Self {
        IngestError::MalformedPayload(err.to_string())
    }
}

impl IngestError {
    /// Label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            IngestError::Unauthorized => "unauthorized",
            IngestError::MalformedPayload(_) => "malformed",
            IngestError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Errors returned by an issue evaluator for a single message.
///
/// Every variant is handled by the worker's retry policy; none of them stop
/// the worker.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Message payload is not a valid work item: {0}")]
    InvalidPayload(String),

    #[error("Evaluator request failed: {0}")]
    RequestFailed(String),

    #[error("Evaluator rejected the work item ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Evaluation failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for EvaluationError {
    fn from(err: reqwest::Error) -> Self {
        EvaluationError::RequestFailed(err.to_string())
    }
}

impl From<serde_json::Error> for EvaluationError {
    fn from(err: serde_json::Error) -> Self {
        EvaluationError::InvalidPayload(err.to_string())
    }
}
