//! Reliable job queues with exactly-once session completion.
//!
//! This module provides the distributed execution backbone:
//!
//! - **QueueManager**: priority and regular lanes over an atomic move-based queue
//! - **JobStatusStore / RetryCounter**: TTL-bounded per-job bookkeeping
//! - **TeamJobRegistry**: which jobs a team has submitted
//! - **SessionManager**: detects, once, that every job of a cohort finished
//! - **WorkerPool**: workers that fetch, execute and settle jobs
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ JobProducer  │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │  session init, then push
//!                  ┌──────────▼───────────┐
//!                  │  priority │ regular  │
//!                  └──────────┬───────────┘
//!                             │  atomic move
//!                      ┌──────▼───────┐
//!                      │  processing  │
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────── decrement-and-check ─────────┘
//!                             │  last one
//!                      ┌──────▼───────┐
//!                      │  event bus   │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use frameflow::config::SchedulerConfig;
//! use frameflow::scheduler::{Job, Scheduler, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::connect("redis://localhost:6379", SchedulerConfig::default()).await?;
//!
//! let jobs = (0..24)
//!     .map(|i| Job::new(format!("frame-{i}"), "rasterizer", "team-a", serde_json::json!({"frame": i})))
//!     .collect();
//! scheduler
//!     .producer()
//!     .start_session("rasterizer", "team-a", "render-42", jobs, serde_json::json!({}))
//!     .await?;
//!
//! let mut pool = WorkerPool::new(scheduler, handler, WorkerPoolConfig::new("rasterizer"));
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic dequeue**: a job is always in exactly one of its lanes or the
//!   processing list
//! - **At-least-once execution**: a failed job goes back to the regular lane
//!   until it runs out of attempts
//! - **Exactly-once completion**: only the caller that drains a session's
//!   counter publishes `session.completed`
//! - **No automatic reaper**: jobs stranded in processing by a crashed worker
//!   stay there until [`QueueManager::recover_processing`] is run

pub mod dedup;
pub mod job;
pub mod keys;
pub mod manager;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod session;
pub mod status;
pub mod worker_pool;

use std::sync::Arc;

pub use dedup::ExpiringSet;
pub use job::{ClaimedJob, Job, JobState, JobStatus};
pub use keys::{KeySpace, QueueKeySet};
pub use manager::{QueueLengths, QueueManager, MAX_PRIORITY_PER_FETCH};
pub use producer::JobProducer;
pub use queue::{QueueError, ReliableQueue};
pub use registry::TeamJobRegistry;
pub use session::{CleanupOutcome, SessionCompleted, SessionManager, SessionRecord};
pub use status::{JobStatusStore, RetryCounter};
pub use worker_pool::{
    JobHandler, PoolError, PoolStats, ProgressReporter, Worker, WorkerPool, WorkerPoolConfig,
};

use crate::config::SchedulerConfig;
use crate::error::StoreError;
use crate::events::{EventBus, RedisEventBus};
use crate::store::{QueueStore, RedisStore};

/// All scheduler components wired to one store and one event bus.
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    manager: QueueManager,
    statuses: JobStatusStore,
    retries: RetryCounter,
    registry: TeamJobRegistry,
    sessions: SessionManager,
}

impl Scheduler {
    pub fn new(store: Arc<dyn QueueStore>, bus: Arc<dyn EventBus>, config: SchedulerConfig) -> Self {
        let keys = KeySpace::new(config.key_prefix.clone());

        Self {
            manager: QueueManager::new(Arc::clone(&store), keys.clone(), config.fetch_timeout),
            statuses: JobStatusStore::new(Arc::clone(&store), keys.clone(), config.status_ttl),
            retries: RetryCounter::new(Arc::clone(&store), keys.clone(), config.retry_ttl),
            registry: TeamJobRegistry::new(Arc::clone(&store), keys.clone()),
            sessions: SessionManager::new(
                store,
                keys,
                config.session_ttl,
                bus,
                config.dedup_window,
            ),
            config,
        }
    }

    /// Connects to Redis and publishes events on `{prefix}:events`.
    pub async fn connect(redis_url: &str, config: SchedulerConfig) -> Result<Self, StoreError> {
        let store = RedisStore::connect(redis_url).await?;
        let channel = KeySpace::new(config.key_prefix.clone()).events_channel();
        let bus = RedisEventBus::from_connection(store.connection(), channel);
        Ok(Self::new(Arc::new(store), Arc::new(bus), config))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn statuses(&self) -> &JobStatusStore {
        &self.statuses
    }

    pub fn retries(&self) -> &RetryCounter {
        &self.retries
    }

    pub fn registry(&self) -> &TeamJobRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn producer(&self) -> JobProducer {
        JobProducer::new(
            self.manager.clone(),
            self.statuses.clone(),
            self.registry.clone(),
            self.sessions.clone(),
        )
    }
}
