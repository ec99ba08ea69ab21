//! dacrew: reliable work queue between Jira webhooks and issue evaluators.
//!
//! Signed webhooks are verified and appended to a durable per-project stream
//! ([`ingest`]). Competing workers claim messages through a consumer group,
//! hand them to an [`evaluator::IssueEvaluator`] and acknowledge or
//! dead-letter them ([`worker`]). Claims abandoned by crashed workers are
//! recovered after an orphan timeout.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod metrics;
pub mod stream;
pub mod webhook;
pub mod worker;

// Re-export commonly used error types
pub use error::{EvaluationError, IngestError};
pub use stream::StoreError;
