//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, RETRIES_TOTAL,
    SESSIONS_COMPLETED_TOTAL,
};

/// Metrics collector for recording scheduler metrics.
///
/// Stateless and cheap to clone. Every method silently does nothing until
/// [`init_metrics`](super::init_metrics) has been called, so library users
/// that never export metrics pay nothing for them.
///
/// # Example
///
/// ```ignore
/// use frameflow::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("rasterizer", "completed", 4.2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished job.
    ///
    /// # Arguments
    ///
    /// * `queue_type` - Queue family the job ran on
    /// * `status` - Outcome (e.g. "completed", "failed", "timeout")
    /// * `duration_secs` - Handler wall time in seconds
    pub fn record_job(&self, queue_type: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue_type, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue_type])
                .observe(duration_secs);
        }

        tracing::trace!(
            queue_type = queue_type,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn record_retry(&self, queue_type: &str) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[queue_type]).inc();
        }
    }

    pub fn record_session_completed(&self, queue_type: &str) {
        if let Some(sessions) = SESSIONS_COMPLETED_TOTAL.get() {
            sessions.with_label_values(&[queue_type]).inc();
        }
    }

    /// Update the length gauge of one list.
    ///
    /// `lane` is one of "regular", "priority" or "processing".
    pub fn set_queue_depth(&self, queue_type: &str, lane: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_type, lane])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_type = queue_type,
            lane = lane,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
