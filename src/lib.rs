//! frameflow: reliable Redis job queues with exactly-once session completion.
//!
//! This library fans per-frame work out across worker processes through
//! priority and regular lanes, keeps per-job status and retry bookkeeping, and
//! announces exactly once when every job of a session has finished.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use error::{EventBusError, SessionError, StoreError};
pub use events::{BroadcastEventBus, EventBus, RedisEventBus, SESSION_COMPLETED_EVENT};
pub use scheduler::{Job, JobHandler, JobState, JobStatus, Scheduler, WorkerPool, WorkerPoolConfig};
pub use store::{MemoryStore, QueueStore, RedisStore};
