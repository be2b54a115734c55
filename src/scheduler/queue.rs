//! Reliable list-based queue primitive.
//!
//! This module provides the three indivisible list operations the rest of the
//! scheduler is built on:
//!
//! - `move_one`: tail of a lane to the head of the processing list
//! - `requeue`: processing list back onto the head of a lane
//! - `ack`: drop one entry from the processing list
//!
//! # Reliability
//!
//! Each operation is a single store round-trip that the backend executes
//! atomically, so a job is never in both a lane and the processing list, nor
//! in neither. Retrying a failed `move_one` cannot double-move: the entry has
//! either moved already or it has not.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::error::{SessionError, StoreError};
use crate::store::QueueStore;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed; the operation is safe to retry.
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A job was submitted to a queue type other than its own.
    #[error("Job {job_id} belongs to queue '{found}', not '{expected}'")]
    QueueTypeMismatch {
        job_id: String,
        expected: String,
        found: String,
    },

    /// The same job id appears twice in one batch.
    #[error("Duplicate job id in batch: {0}")]
    DuplicateJob(String),

    /// Session bookkeeping failed while dispatching.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Atomic move/requeue/ack over raw list entries.
#[derive(Clone)]
pub struct ReliableQueue {
    store: Arc<dyn QueueStore>,
}

impl ReliableQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Moves one entry from the tail of `queue_key` to the head of
    /// `processing_key`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(entry))` if an entry was moved
    /// - `Ok(None)` if the lane stayed empty for the whole `timeout`
    ///   (immediately when `timeout` is `None`)
    pub async fn move_one(
        &self,
        queue_key: &str,
        processing_key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, QueueError> {
        Ok(self.store.move_one(queue_key, processing_key, timeout).await?)
    }

    /// Pushes `entry` back onto the head of `queue_key` and removes one
    /// matching occurrence from `processing_key`.
    ///
    /// Returns whether the entry was found in the processing list.
    pub async fn requeue(
        &self,
        queue_key: &str,
        processing_key: &str,
        entry: &str,
    ) -> Result<bool, QueueError> {
        Ok(self.store.requeue(queue_key, processing_key, entry).await?)
    }

    /// Removes one occurrence of `entry` from `processing_key`.
    ///
    /// Returns whether the entry was present.
    pub async fn ack(&self, processing_key: &str, entry: &str) -> Result<bool, QueueError> {
        Ok(self.store.ack(processing_key, entry).await?)
    }
}
