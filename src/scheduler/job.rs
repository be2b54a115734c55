//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A unit of work carried through the lanes
//! - `ClaimedJob`: A job a worker has moved into the processing list
//! - `JobState`: Lifecycle state of a job
//! - `JobStatus`: Last known status record of a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::QueueKeySet;

/// A job representing a unit of work to be executed.
///
/// Jobs are serialized as JSON envelopes onto the lane lists. The payload is
/// carried verbatim; the scheduler never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-assigned identifier, unique within its queue type.
    pub job_id: String,
    /// Queue family (e.g. "rasterizer", "analysis").
    pub queue_type: String,
    /// Owning team.
    pub team_id: String,
    /// Cohort this job belongs to, if it was dispatched as part of a batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Whether the job goes onto the priority lane.
    #[serde(default)]
    pub priority: bool,
    /// Opaque job body.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new regular-lane job that is not part of a session.
    pub fn new(
        job_id: impl Into<String>,
        queue_type: impl Into<String>,
        team_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            queue_type: queue_type.into(),
            team_id: team_id.into(),
            session_id: None,
            priority: false,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Tags the job with a session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the lane the job is enqueued on.
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }
}

/// A job checked out into a processing list.
///
/// Keeps the exact bytes that were moved so that acking or requeueing removes
/// that same entry from the processing list.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    job: Job,
    raw: String,
    keys: QueueKeySet,
}

impl ClaimedJob {
    pub(crate) fn new(job: Job, raw: String, keys: QueueKeySet) -> Self {
        Self { job, raw, keys }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// The serialized entry as it sits in the processing list.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Keys of the queue this job was fetched from.
    pub fn keys(&self) -> &QueueKeySet {
        &self.keys
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in a lane.
    Queued,
    /// Checked out by a worker.
    Processing,
    /// Failed and about to be put back on the regular lane.
    Retrying,
    /// Back on the regular lane after a failure.
    QueuedAfterFailure,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting its attempts.
    Failed,
}

impl JobState {
    /// Returns whether no further transitions follow this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Processing => write!(f, "processing"),
            JobState::Retrying => write!(f, "retrying"),
            JobState::QueuedAfterFailure => write!(f, "queued_after_failure"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Last known status of a job.
///
/// Overwritten on every transition and expired after a TTL; this is
/// observability state, not an audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: JobState,
    /// Progress percentage, 0..=100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn new(job_id: impl Into<String>, status: JobState) -> Self {
        let progress = if status == JobState::Completed { 100 } else { 0 };
        Self {
            job_id: job_id.into(),
            status,
            progress,
            message: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Sets the progress, clamped to 100.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
