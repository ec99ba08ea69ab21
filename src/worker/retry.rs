//! Retry budget and backoff.
//!
//! A message may be delivered at most `max_retries + 1` times: one first
//! attempt plus `max_retries` retries. The decision after a failure is made
//! from the delivery count of the claim that failed:
//!
//! | delivery | `max_retries = 2` |
//! |----------|-------------------|
//! | 1        | retry             |
//! | 2        | retry             |
//! | 3        | dead-letter       |
//!
//! Retrying needs no action: the claim is left to lapse and the message is
//! picked up again once the orphan timeout has passed.

use std::time::Duration;

/// Outcome of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the message pending so it is delivered again.
    Retry {
        /// Deliveries still allowed after this one.
        remaining: u32,
    },
    /// The budget is spent; move the message to the dead letter stream.
    DeadLetter,
}

/// Dead-letter threshold derived from `delivery_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries after the first attempt.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total deliveries allowed.
    pub fn max_deliveries(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Decides what happens after delivery number `delivery_count` failed.
    pub fn after_failure(&self, delivery_count: u32) -> RetryDecision {
        if delivery_count <= self.max_retries {
            RetryDecision::Retry {
                remaining: self.max_deliveries() - delivery_count,
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Whether a claim with this delivery count is already over budget.
    ///
    /// Happens when the previous owner stopped without reporting the
    /// outcome of the last allowed delivery.
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count > self.max_deliveries()
    }
}

/// Exponential backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff {
    /// Creates a backoff starting at `initial` and doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the next delay and doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
