//! The issue evaluator seam.
//!
//! Workers hand every claimed envelope to an [`IssueEvaluator`]. What the
//! evaluator does with it (agent selection, LLM calls, writing back to Jira)
//! is opaque to the queue; only success or [`EvaluationError`] matters.
//!
//! Two implementations ship with the crate:
//! - [`MockEvaluator`]: logs the issue and sleeps, for development
//! - [`HttpEvaluator`]: forwards the work item to an external agent service

mod http;
mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::error::EvaluationError;
use crate::stream::Envelope;

pub use http::{EvaluationRequest, HttpEvaluator, MESSAGE_ID_HEADER};
pub use mock::MockEvaluator;

/// Processes one queued message.
///
/// Implementations may be slow and may fail. They are called at most once at
/// a time per worker, and the same message can be delivered more than once,
/// so processing should be idempotent.
#[async_trait]
pub trait IssueEvaluator: Send + Sync {
    /// Evaluates the envelope's payload.
    async fn process(&self, envelope: &Envelope) -> Result<(), EvaluationError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Builds the evaluator selected by the worker configuration.
///
/// # Errors
///
/// Returns `EvaluationError::RequestFailed` if the HTTP client cannot be
/// built, and `EvaluationError::Failed` if no evaluator URL is configured
/// while mock processing is off.
pub fn from_config(config: &WorkerConfig) -> Result<Arc<dyn IssueEvaluator>, EvaluationError> {
    if config.mock_processing {
        return Ok(Arc::new(MockEvaluator::new(config.mock_delay)));
    }

    let url = config.evaluator_url.as_deref().ok_or_else(|| {
        EvaluationError::Failed("no evaluator URL configured".to_string())
    })?;

    Ok(Arc::new(HttpEvaluator::new(url, config.evaluation_timeout)?))
}
