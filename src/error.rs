//! Error types for frameflow operations.
//!
//! Defines the error types shared across subsystems:
//! - Store access (Redis or in-memory backends)
//! - Session tracking
//! - Event bus publishing
//!
//! Queue and worker pool errors live next to their modules
//! (`scheduler::queue::QueueError`, `scheduler::worker_pool::PoolError`).

use thiserror::Error;

/// Errors raised by a `QueueStore` backend.
///
/// Every variant except `Serialization` is a transport-level failure: the
/// operation may or may not have been applied and is safe to retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backing store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to (de)serialize a stored value.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A server-side script returned a reply this client does not understand.
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),

    /// Backend-specific failure (e.g. a poisoned in-memory lock).
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors that can occur while tracking sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session '{0}' must contain at least one job")]
    EmptySession(String),

    /// A live session with this id already exists; its counter was left as is.
    #[error("Session '{0}' already exists")]
    AlreadyExists(String),
}

/// Errors that can occur while publishing events.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Redis publish failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to connect event bus: {0}")]
    ConnectionFailed(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
