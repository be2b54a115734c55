//! Producer-side entry point: plain enqueues and session dispatch.

use std::collections::HashSet;

use tracing::info;

use super::job::{Job, JobState};
use super::manager::QueueManager;
use super::queue::QueueError;
use super::registry::TeamJobRegistry;
use super::session::{SessionManager, SessionRecord};
use super::status::JobStatusStore;
use crate::error::SessionError;

/// Enqueues jobs with their status and team bookkeeping in place.
#[derive(Clone)]
pub struct JobProducer {
    manager: QueueManager,
    statuses: JobStatusStore,
    registry: TeamJobRegistry,
    sessions: SessionManager,
}

impl JobProducer {
    pub fn new(
        manager: QueueManager,
        statuses: JobStatusStore,
        registry: TeamJobRegistry,
        sessions: SessionManager,
    ) -> Self {
        Self {
            manager,
            statuses,
            registry,
            sessions,
        }
    }

    /// Enqueues `jobs` onto one lane of `queue_type`.
    ///
    /// Each job gets a `queued` status and is registered with its team before
    /// the push, so a worker never picks up a job that has no status yet.
    /// The jobs' own `priority` flags are overwritten by `priority`.
    pub async fn enqueue(
        &self,
        queue_type: &str,
        jobs: Vec<Job>,
        priority: bool,
    ) -> Result<usize, QueueError> {
        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|job| job.with_priority(priority))
            .collect();
        self.dispatch(queue_type, &jobs).await?;

        info!(
            queue_type = queue_type,
            count = jobs.len(),
            priority = priority,
            "Enqueued jobs"
        );
        Ok(jobs.len())
    }

    /// Dispatches `jobs` as one session.
    ///
    /// The session is initialized with `total_jobs = jobs.len()` before any job
    /// is pushed. Each job goes onto the lane chosen by its own `priority`
    /// flag. Job ids must be distinct within the session, and the session id
    /// must not belong to a live session: reusing one fails with
    /// `SessionError::AlreadyExists` and pushes nothing.
    pub async fn start_session(
        &self,
        queue_type: &str,
        team_id: &str,
        session_id: &str,
        jobs: Vec<Job>,
        metadata: serde_json::Value,
    ) -> Result<SessionRecord, QueueError> {
        if jobs.is_empty() {
            return Err(SessionError::EmptySession(session_id.to_string()).into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = jobs.iter().find(|job| !seen.insert(job.job_id.as_str())) {
            return Err(QueueError::DuplicateJob(dup.job_id.clone()));
        }

        check_queue_type(queue_type, &jobs)?;

        let record = SessionRecord::new(session_id, team_id, queue_type, jobs.len() as u64)
            .with_metadata(metadata);
        if !self.sessions.initialize_session(&record).await? {
            return Err(SessionError::AlreadyExists(session_id.to_string()).into());
        }

        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|job| job.with_session(session_id))
            .collect();
        self.dispatch(queue_type, &jobs).await?;

        info!(
            queue_type = queue_type,
            team_id = team_id,
            session_id = session_id,
            total_jobs = record.total_jobs,
            "Session dispatched"
        );
        Ok(record)
    }

    async fn dispatch(&self, queue_type: &str, jobs: &[Job]) -> Result<(), QueueError> {
        check_queue_type(queue_type, jobs)?;

        for job in jobs {
            self.statuses.set_state(&job.job_id, JobState::Queued).await?;
            self.registry.add_to_team(&job.team_id, &job.job_id).await?;
        }
        self.manager.enqueue(queue_type, jobs).await
    }
}

fn check_queue_type(queue_type: &str, jobs: &[Job]) -> Result<(), QueueError> {
    match jobs.iter().find(|job| job.queue_type != queue_type) {
        Some(job) => Err(QueueError::QueueTypeMismatch {
            job_id: job.job_id.clone(),
            expected: queue_type.to_string(),
            found: job.queue_type.clone(),
        }),
        None => Ok(()),
    }
}
