//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by dacrew and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all dacrew metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Webhooks received, labeled by outcome (accepted, unauthorized, ...).
pub static INGESTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages evaluated, labeled by outcome (acknowledged, retry, dead_lettered).
pub static MESSAGES_PROCESSED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages moved to a dead letter stream.
pub static DEAD_LETTERED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Orphaned claims released by the reclaimer.
pub static RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Failed stream store calls, labeled by operation.
pub static STORE_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of workers currently evaluating a message.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Evaluation duration in seconds.
pub static EVALUATION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Stream length, labeled by stream key.
pub static STREAM_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls register into a fresh registry that is
/// then discarded, so they are harmless.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Ingest metrics
    let ingested_total = CounterVec::new(
        Opts::new("dacrew_ingested_total", "Webhooks received by outcome"),
        &["outcome"],
    )?;

    // Worker metrics
    let messages_processed_total = CounterVec::new(
        Opts::new(
            "dacrew_messages_processed_total",
            "Messages evaluated by outcome",
        ),
        &["outcome"],
    )?;

    let dead_lettered_total = Counter::new(
        "dacrew_dead_lettered_total",
        "Messages moved to a dead letter stream",
    )?;

    let reclaimed_total = Counter::new(
        "dacrew_reclaimed_total",
        "Orphaned claims released by the reclaimer",
    )?;

    let store_errors_total = CounterVec::new(
        Opts::new("dacrew_store_errors_total", "Failed stream store calls"),
        &["operation"],
    )?;

    let active_workers = Gauge::new(
        "dacrew_active_workers",
        "Number of workers currently evaluating a message",
    )?;

    let evaluation_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "dacrew_evaluation_duration_seconds",
            "Evaluation duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )?;

    // Stream metrics
    let stream_depth = GaugeVec::new(
        Opts::new("dacrew_stream_depth", "Number of entries in a stream"),
        &["stream"],
    )?;

    registry.register(Box::new(ingested_total.clone()))?;
    registry.register(Box::new(messages_processed_total.clone()))?;
    registry.register(Box::new(dead_lettered_total.clone()))?;
    registry.register(Box::new(reclaimed_total.clone()))?;
    registry.register(Box::new(store_errors_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(evaluation_duration.clone()))?;
    registry.register(Box::new(stream_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = INGESTED_TOTAL.set(ingested_total);
    let _ = MESSAGES_PROCESSED_TOTAL.set(messages_processed_total);
    let _ = DEAD_LETTERED_TOTAL.set(dead_lettered_total);
    let _ = RECLAIMED_TOTAL.set(reclaimed_total);
    let _ = STORE_ERRORS_TOTAL.set(store_errors_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = EVALUATION_DURATION.set(evaluation_duration);
    let _ = STREAM_DEPTH.set(stream_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
