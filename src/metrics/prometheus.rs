//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by frameflow and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all frameflow metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished jobs, labeled by queue type and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler wall time in seconds, labeled by queue type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// List lengths, labeled by queue type and lane.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Jobs put back on the regular lane after a failure.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sessions whose completion event was emitted.
pub static SESSIONS_COMPLETED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording methods on
/// [`MetricsCollector`](super::MetricsCollector) are no-ops until this runs.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid or a name
/// is registered twice.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("frameflow_jobs_total", "Total number of finished jobs"),
        &["queue_type", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "frameflow_job_duration_seconds",
            "Job handler duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        &["queue_type"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("frameflow_retries_total", "Total number of job retries"),
        &["queue_type"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("frameflow_queue_depth", "Number of entries per list"),
        &["queue_type", "lane"],
    )?;

    let jobs_in_progress = Gauge::new(
        "frameflow_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Session metrics
    let sessions_completed_total = CounterVec::new(
        Opts::new(
            "frameflow_sessions_completed_total",
            "Total number of completed sessions",
        ),
        &["queue_type"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("frameflow_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(sessions_completed_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = SESSIONS_COMPLETED_TOTAL.set(sessions_completed_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead if metrics were never
/// initialized or encoding fails.
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
