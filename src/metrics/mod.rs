//! Prometheus-based monitoring of ingestion and message processing.
//!
//! # Example
//!
//! ```ignore
//! use dacrew::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_ingest("accepted");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, ProcessOutcome};
pub use prometheus::{export_metrics, init_metrics};
