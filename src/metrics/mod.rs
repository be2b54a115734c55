//! Prometheus metrics for queues, workers and sessions.
//!
//! # Example
//!
//! ```ignore
//! use frameflow::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("rasterizer", "completed", 12.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, REGISTRY,
    RETRIES_TOTAL, SESSIONS_COMPLETED_TOTAL,
};
