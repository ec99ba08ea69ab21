//! Stream consumers.
//!
//! - [`Worker`]: claims, evaluates and acknowledges messages
//! - [`OrphanReclaimer`]: returns lapsed claims to the group
//! - [`WorkerPool`]: runs both inside one process

mod consumer;
mod pool;
mod reclaimer;
mod retry;
mod stats;

pub use consumer::{BatchReport, Worker, WorkerOptions, WorkerState};
pub use pool::{PoolError, WorkerPool};
pub use reclaimer::OrphanReclaimer;
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use stats::{PoolStats, SharedPoolStats};
