//! Job status records and retry counters.
//!
//! Both are single-key-per-job, TTL-bounded entries with no references to
//! each other; the job id is the only link.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::store::QueueStore;

use super::job::{JobState, JobStatus};
use super::keys::KeySpace;

/// Last-write-wins status record per job.
#[derive(Clone)]
pub struct JobStatusStore {
    store: Arc<dyn QueueStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl JobStatusStore {
    pub fn new(store: Arc<dyn QueueStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    /// Writes a status with the default TTL.
    pub async fn set_status(&self, status: &JobStatus) -> Result<(), StoreError> {
        self.set_status_with_ttl(status, self.ttl).await
    }

    /// Writes a status, replacing the previous one and restarting its TTL.
    pub async fn set_status_with_ttl(
        &self,
        status: &JobStatus,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(status)?;
        self.store
            .set_with_ttl(&self.keys.status(&status.job_id), &value, ttl)
            .await
    }

    /// Shorthand for writing a bare state transition.
    pub async fn set_state(&self, job_id: &str, state: JobState) -> Result<(), StoreError> {
        self.set_status(&JobStatus::new(job_id, state)).await
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobStatus>, StoreError> {
        match self.store.get(&self.keys.status(job_id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_status(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.delete(&self.keys.status(job_id)).await
    }
}

/// Per-job attempt counter.
///
/// Only counts. Deciding how many attempts are too many is up to the caller.
#[derive(Clone)]
pub struct RetryCounter {
    store: Arc<dyn QueueStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl RetryCounter {
    pub fn new(store: Arc<dyn QueueStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    /// Atomically increments the counter and restarts its TTL.
    ///
    /// # Returns
    ///
    /// The new attempt count, starting at 1 for a fresh job.
    pub async fn increment(&self, job_id: &str) -> Result<i64, StoreError> {
        self.store
            .increment_with_ttl(&self.keys.retries(job_id), self.ttl)
            .await
    }

    /// Returns the current count without incrementing (0 if absent).
    pub async fn current(&self, job_id: &str) -> Result<i64, StoreError> {
        match self.store.get(&self.keys.retries(job_id)).await? {
            Some(value) => value.parse().map_err(|_| {
                StoreError::Backend(format!("retry counter for '{}' is not an integer", job_id))
            }),
            None => Ok(0),
        }
    }

    pub async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.delete(&self.keys.retries(job_id)).await
    }
}
