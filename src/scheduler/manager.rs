//! Two-lane queue manager.
//!
//! Every queue type has a priority lane and a regular lane sharing one
//! processing list. Fetches drain the priority lane first but take at most
//! [`MAX_PRIORITY_PER_FETCH`] priority jobs per call, so the regular lane keeps
//! moving under sustained priority load. Retried jobs always go back to the
//! regular lane.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::job::{ClaimedJob, Job};
use super::keys::{KeySpace, QueueKeySet};
use super::queue::{QueueError, ReliableQueue};
use crate::metrics::MetricsCollector;
use crate::store::{ListPush, QueueStore};

/// Upper bound on priority-lane jobs handed out by a single fetch.
pub const MAX_PRIORITY_PER_FETCH: usize = 5;

/// Snapshot of lane sizes for one queue type.
///
/// Eventually consistent: producers and workers may have moved on by the time
/// the caller looks at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLengths {
    /// Jobs waiting on the regular lane.
    pub pending: usize,
    /// Jobs checked out by workers.
    pub processing: usize,
    /// Jobs waiting on the priority lane.
    pub priority: usize,
}

impl QueueLengths {
    /// Returns the number of jobs not yet finished.
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.priority
    }
}

/// Priority/regular lane composition over [`ReliableQueue`].
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    queue: ReliableQueue,
    keys: KeySpace,
    fetch_timeout: Option<Duration>,
    metrics: MetricsCollector,
}

impl QueueManager {
    /// Creates a manager.
    ///
    /// `fetch_timeout` bounds how long an otherwise empty fetch waits for work;
    /// `Duration::ZERO` makes every fetch non-blocking.
    pub fn new(store: Arc<dyn QueueStore>, keys: KeySpace, fetch_timeout: Duration) -> Self {
        Self {
            queue: ReliableQueue::new(Arc::clone(&store)),
            store,
            keys,
            fetch_timeout: (!fetch_timeout.is_zero()).then_some(fetch_timeout),
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the key space used by this manager.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Pushes regular and priority jobs in a single round-trip.
    ///
    /// No ordering is promised between the two lanes. If the round-trip fails
    /// part of the batch may already be queued; re-submit with the same job ids.
    pub async fn add_jobs_batch(
        &self,
        queue_type: &str,
        regular: &[Job],
        priority: &[Job],
    ) -> Result<(), QueueError> {
        let keys = self.keys.queue(queue_type);
        let regular = serialize_for(queue_type, regular)?;
        let priority = serialize_for(queue_type, priority)?;
        let (regular_count, priority_count) = (regular.len(), priority.len());

        self.store
            .push_batch(&[
                ListPush::new(keys.queue_key, regular),
                ListPush::new(keys.priority_queue_key, priority),
            ])
            .await?;

        debug!(
            queue_type = queue_type,
            regular = regular_count,
            priority = priority_count,
            "Jobs enqueued"
        );
        Ok(())
    }

    /// Enqueues jobs onto the lane selected by each job's `priority` flag.
    pub async fn enqueue(&self, queue_type: &str, jobs: &[Job]) -> Result<(), QueueError> {
        let (priority, regular): (Vec<Job>, Vec<Job>) =
            jobs.iter().cloned().partition(|job| job.priority);
        self.add_jobs_batch(queue_type, &regular, &priority).await
    }

    /// Checks out up to `count` jobs, priority lane first.
    ///
    /// At most `min(count, MAX_PRIORITY_PER_FETCH)` jobs come from the priority
    /// lane; the rest of `count` is filled from the regular lane. When both
    /// lanes are empty the first regular-lane move blocks for up to the
    /// configured fetch timeout.
    ///
    /// If the store fails after some jobs were already moved, those jobs are
    /// returned instead of the error so they are not stranded in processing.
    pub async fn fetch_jobs(
        &self,
        queue_type: &str,
        count: usize,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let keys = self.keys.queue(queue_type);
        let mut claimed = Vec::with_capacity(count);

        let priority_quota = count.min(MAX_PRIORITY_PER_FETCH);
        while claimed.len() < priority_quota {
            match self
                .claim_one(&keys, &keys.priority_queue_key, None, &mut claimed)
                .await
            {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return partial_or_error(queue_type, claimed, e),
            }
        }

        // Only the first move of an otherwise empty fetch may block.
        let mut may_block = claimed.is_empty();
        while claimed.len() < count {
            let timeout = if may_block { self.fetch_timeout } else { None };
            may_block = false;
            match self
                .claim_one(&keys, &keys.queue_key, timeout, &mut claimed)
                .await
            {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return partial_or_error(queue_type, claimed, e),
            }
        }

        Ok(claimed)
    }

    /// Moves a checked-out job back onto the head of the regular lane.
    ///
    /// Used both when a fetched job could not be dispatched and when its
    /// execution failed and will be retried. Returns whether the job was
    /// still in the processing list.
    pub async fn return_job_to_queue(&self, claimed: &ClaimedJob) -> Result<bool, QueueError> {
        let keys = claimed.keys();
        let found = self
            .queue
            .requeue(&keys.queue_key, &keys.processing_key, claimed.raw())
            .await?;

        if !found {
            warn!(
                job_id = %claimed.job().job_id,
                queue_type = %keys.queue_type,
                "Requeued job was not in the processing list"
            );
        }
        Ok(found)
    }

    /// Same operation as [`QueueManager::return_job_to_queue`].
    pub async fn requeue_job(&self, claimed: &ClaimedJob) -> Result<bool, QueueError> {
        self.return_job_to_queue(claimed).await
    }

    /// Removes a finished job from the processing list.
    pub async fn ack_job(&self, claimed: &ClaimedJob) -> Result<bool, QueueError> {
        self.queue
            .ack(&claimed.keys().processing_key, claimed.raw())
            .await
    }

    /// Reads the three list lengths of a queue type.
    pub async fn get_queue_lengths(&self, queue_type: &str) -> Result<QueueLengths, QueueError> {
        let keys = self.keys.queue(queue_type);
        let lengths = self
            .store
            .list_lengths(&[
                &keys.queue_key,
                &keys.processing_key,
                &keys.priority_queue_key,
            ])
            .await?;

        let lengths = QueueLengths {
            pending: lengths.first().copied().unwrap_or_default(),
            processing: lengths.get(1).copied().unwrap_or_default(),
            priority: lengths.get(2).copied().unwrap_or_default(),
        };

        self.metrics.set_queue_depth(queue_type, "regular", lengths.pending);
        self.metrics
            .set_queue_depth(queue_type, "processing", lengths.processing);
        self.metrics.set_queue_depth(queue_type, "priority", lengths.priority);

        Ok(lengths)
    }

    /// Lists the jobs currently checked out for a queue type.
    pub async fn processing_jobs(&self, queue_type: &str) -> Result<Vec<Job>, QueueError> {
        let keys = self.keys.queue(queue_type);
        let entries = self.store.list_items(&keys.processing_key).await?;

        Ok(entries
            .iter()
            .filter_map(|raw| serde_json::from_str::<Job>(raw).ok())
            .collect())
    }

    /// Moves every processing entry of a queue type back onto its regular lane.
    ///
    /// Nothing calls this automatically: a processing entry may belong to a
    /// worker that is still running. Operators run it once the workers of a
    /// queue type are known to be gone.
    ///
    /// # Returns
    ///
    /// The number of jobs recovered.
    pub async fn recover_processing(&self, queue_type: &str) -> Result<usize, QueueError> {
        let keys = self.keys.queue(queue_type);
        let entries = self.store.list_items(&keys.processing_key).await?;

        let mut recovered = 0;
        for entry in entries {
            if self
                .queue
                .requeue(&keys.queue_key, &keys.processing_key, &entry)
                .await?
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(
                queue_type = queue_type,
                recovered = recovered,
                "Recovered jobs from processing list"
            );
        }
        Ok(recovered)
    }

    /// Moves one entry out of `lane` and decodes it into `claimed`.
    ///
    /// Returns `false` once the lane is empty.
    async fn claim_one(
        &self,
        keys: &QueueKeySet,
        lane: &str,
        timeout: Option<Duration>,
        claimed: &mut Vec<ClaimedJob>,
    ) -> Result<bool, QueueError> {
        let Some(raw) = self
            .queue
            .move_one(lane, &keys.processing_key, timeout)
            .await?
        else {
            return Ok(false);
        };

        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => claimed.push(ClaimedJob::new(job, raw, keys.clone())),
            Err(e) => {
                // An undecodable entry can never be processed; drop it rather
                // than let it sit in the processing list forever.
                error!(
                    queue_type = %keys.queue_type,
                    error = %e,
                    entry = %raw,
                    "Dropping malformed job entry"
                );
                self.queue.ack(&keys.processing_key, &raw).await?;
            }
        }
        Ok(true)
    }
}

fn serialize_for(queue_type: &str, jobs: &[Job]) -> Result<Vec<String>, QueueError> {
    jobs.iter()
        .map(|job| {
            if job.queue_type != queue_type {
                return Err(QueueError::QueueTypeMismatch {
                    job_id: job.job_id.clone(),
                    expected: queue_type.to_string(),
                    found: job.queue_type.clone(),
                });
            }
            Ok(serde_json::to_string(job)?)
        })
        .collect()
}

fn partial_or_error(
    queue_type: &str,
    claimed: Vec<ClaimedJob>,
    error: QueueError,
) -> Result<Vec<ClaimedJob>, QueueError> {
    if claimed.is_empty() {
        return Err(error);
    }
    warn!(
        queue_type = queue_type,
        fetched = claimed.len(),
        error = %error,
        "Fetch interrupted, returning jobs already checked out"
    );
    Ok(claimed)
}
