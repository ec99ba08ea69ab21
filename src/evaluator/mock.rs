//! Evaluator that only logs what it would do.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::IssueEvaluator;
use crate::error::EvaluationError;
use crate::stream::Envelope;
use crate::webhook::JiraEvent;

/// Logs the issue carried by each envelope and simulates processing time.
#[derive(Debug, Clone)]
pub struct MockEvaluator {
    delay: Duration,
}

impl MockEvaluator {
    /// Creates a mock evaluator that sleeps `delay` per message.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Simulated processing time.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait]
impl IssueEvaluator for MockEvaluator {
    async fn process(&self, envelope: &Envelope) -> Result<(), EvaluationError> {
        let event: JiraEvent = serde_json::from_value(envelope.payload.clone())?;

        info!(
            message_id = %envelope.id,
            work_id = %event.work_id,
            source = %event.source,
            issue = %event.issue_key,
            event = %event.event,
            delivery_count = envelope.delivery_count,
            "[MOCK] Processing work item"
        );
        info!(
            issue = %event.issue_key,
            issue_type = event.issue_type().unwrap_or("unknown"),
            status = event.status().unwrap_or("unknown"),
            priority = event.priority().unwrap_or("unknown"),
            assignee = event.assignee().unwrap_or("unassigned"),
            summary = event.summary().unwrap_or(""),
            "[MOCK] Issue details"
        );
        for change in event.changelog() {
            info!(
                issue = %event.issue_key,
                field = %change.field,
                from = change.from.as_deref().unwrap_or(""),
                to = change.to.as_deref().unwrap_or(""),
                "[MOCK] Changed field"
            );
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        info!(work_id = %event.work_id, "[MOCK] Processing completed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
