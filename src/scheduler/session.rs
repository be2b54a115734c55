//! Session tracking and exactly-once completion signaling.
//!
//! A session is a cohort of jobs dispatched together. It is stored as a JSON
//! record plus a `remaining` counter, both TTL-bounded. Every worker that
//! finishes a sessioned job calls [`SessionManager::check_and_cleanup_session`],
//! which runs one indivisible decrement-and-check on the store. Exactly one
//! caller across all processes sees the counter reach zero; that caller deletes
//! the session and publishes [`SESSION_COMPLETED_EVENT`].
//!
//! The in-process [`ExpiringSet`] remembers sessions this process has just
//! cleaned. It is only consulted after the store reports no counter, to tell a
//! late duplicate apart from a session that was never set up. It never skips
//! a decrement.
//!
//! # Delivery
//!
//! The record is deleted before the event is published. If publishing fails
//! the event is lost; it is logged and never retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::dedup::ExpiringSet;
use super::job::Job;
use super::keys::KeySpace;
use crate::error::SessionError;
use crate::events::{EventBus, SESSION_COMPLETED_EVENT};
use crate::metrics::MetricsCollector;
use crate::store::{QueueStore, SessionDecrement};

/// Stored description of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub team_id: String,
    pub queue_type: String,
    pub total_jobs: u64,
    pub start_time: DateTime<Utc>,
    /// Caller-supplied context, echoed back in the completion event.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        team_id: impl Into<String>,
        queue_type: impl Into<String>,
        total_jobs: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            team_id: team_id.into(),
            queue_type: queue_type.into(),
            total_jobs,
            start_time: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Payload of the `session.completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompleted {
    pub session_id: String,
    pub team_id: String,
    pub queue_type: String,
    pub total_jobs: u64,
    pub start_time: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl SessionCompleted {
    fn from_record(record: SessionRecord, completed_at: DateTime<Utc>) -> Self {
        Self {
            session_id: record.session_id,
            team_id: record.team_id,
            queue_type: record.queue_type,
            total_jobs: record.total_jobs,
            start_time: record.start_time,
            completed_at,
            metadata: record.metadata,
        }
    }

    /// Event for a session whose record was lost before its counter drained.
    fn degraded(session_id: &str, job: &Job, completed_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            team_id: job.team_id.clone(),
            queue_type: job.queue_type.clone(),
            total_jobs: 0,
            start_time: completed_at,
            completed_at,
            metadata: serde_json::Value::Null,
        }
    }
}

/// What a call to [`SessionManager::check_and_cleanup_session`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    /// The job carries no session id.
    NotSessioned,
    /// No counter exists, and this process cleaned the session moments ago.
    AlreadyCleaning,
    /// Other jobs of the session are still outstanding.
    Pending { remaining: i64 },
    /// This call finished the session.
    Cleaned {
        event: SessionCompleted,
        /// Whether the event bus accepted the event.
        published: bool,
    },
    /// No counter exists: never initialized, expired, or cleaned elsewhere.
    Missing,
}

/// Owns session records, their counters, and completion events.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn QueueStore>,
    keys: KeySpace,
    ttl: Duration,
    bus: Arc<dyn EventBus>,
    cleaning: Arc<ExpiringSet>,
    metrics: MetricsCollector,
}

impl SessionManager {
    /// Creates a manager.
    ///
    /// `ttl` bounds the lifetime of records of sessions that never drain;
    /// `dedup_window` is how long a cleaned session id is remembered locally.
    pub fn new(
        store: Arc<dyn QueueStore>,
        keys: KeySpace,
        ttl: Duration,
        bus: Arc<dyn EventBus>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            ttl,
            bus,
            cleaning: Arc::new(ExpiringSet::new(dedup_window)),
            metrics: MetricsCollector::new(),
        }
    }

    /// Writes the session record and its `remaining` counter.
    ///
    /// Returns `false` if a record for this session already exists, in which
    /// case nothing is overwritten.
    pub async fn initialize_session(&self, record: &SessionRecord) -> Result<bool, SessionError> {
        if record.total_jobs == 0 {
            return Err(SessionError::EmptySession(record.session_id.clone()));
        }

        let value = serde_json::to_string(record)?;
        let created = self
            .store
            .init_session(
                &self.keys.session(&record.session_id),
                &self.keys.session_remaining(&record.session_id),
                &value,
                record.total_jobs as i64,
                self.ttl,
            )
            .await?;

        if created {
            // A reused id must not be short-circuited by an earlier cleanup.
            self.cleaning.remove(&record.session_id);
            info!(
                session_id = %record.session_id,
                team_id = %record.team_id,
                queue_type = %record.queue_type,
                total_jobs = record.total_jobs,
                "Session initialized"
            );
        } else {
            warn!(
                session_id = %record.session_id,
                "Session already exists, keeping existing record"
            );
        }
        Ok(created)
    }

    /// Counts one finished job against its session.
    ///
    /// Call once per job that reached a terminal state. The caller that takes
    /// the counter to zero deletes the session and publishes the completion
    /// event. Every other caller gets `Pending`, `Missing` or `AlreadyCleaning`.
    pub async fn check_and_cleanup_session(&self, job: &Job) -> Result<CleanupOutcome, SessionError> {
        let Some(session_id) = job.session_id.as_deref() else {
            return Ok(CleanupOutcome::NotSessioned);
        };

        let decrement = self
            .store
            .decrement_session(
                &self.keys.session(session_id),
                &self.keys.session_remaining(session_id),
            )
            .await?;

        match decrement {
            SessionDecrement::Pending { remaining } => {
                debug!(
                    session_id = session_id,
                    job_id = %job.job_id,
                    remaining = remaining,
                    "Session still has outstanding jobs"
                );
                Ok(CleanupOutcome::Pending { remaining })
            }
            SessionDecrement::Missing if self.cleaning.contains(session_id) => {
                debug!(
                    session_id = session_id,
                    job_id = %job.job_id,
                    "Session was already cleaned by this process"
                );
                Ok(CleanupOutcome::AlreadyCleaning)
            }
            SessionDecrement::Missing => {
                warn!(
                    session_id = session_id,
                    job_id = %job.job_id,
                    "No counter for session; it expired or was never initialized"
                );
                Ok(CleanupOutcome::Missing)
            }
            SessionDecrement::Cleaned { record } => {
                self.cleaning.insert(session_id);
                let event = self.completion_event(session_id, job, record.as_deref());
                let published = self.publish(&event).await;
                self.metrics.record_session_completed(&event.queue_type);
                Ok(CleanupOutcome::Cleaned { event, published })
            }
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        match self.store.get(&self.keys.session(session_id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Returns the outstanding job count, or `None` if no counter exists.
    pub async fn remaining(&self, session_id: &str) -> Result<Option<i64>, SessionError> {
        let value = self
            .store
            .get(&self.keys.session_remaining(session_id))
            .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn completion_event(&self, session_id: &str, job: &Job, record: Option<&str>) -> SessionCompleted {
        let completed_at = Utc::now();
        let parsed = record.map(serde_json::from_str::<SessionRecord>);

        match parsed {
            Some(Ok(record)) => SessionCompleted::from_record(record, completed_at),
            Some(Err(e)) => {
                warn!(
                    session_id = session_id,
                    error = %e,
                    "Session record is unreadable, publishing degraded completion"
                );
                SessionCompleted::degraded(session_id, job, completed_at)
            }
            None => {
                warn!(
                    session_id = session_id,
                    "Session record was missing, publishing degraded completion"
                );
                SessionCompleted::degraded(session_id, job, completed_at)
            }
        }
    }

    async fn publish(&self, event: &SessionCompleted) -> bool {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(session_id = %event.session_id, error = %e, "Failed to encode session event");
                return false;
            }
        };

        match self.bus.publish(SESSION_COMPLETED_EVENT, payload).await {
            Ok(()) => {
                info!(
                    session_id = %event.session_id,
                    team_id = %event.team_id,
                    total_jobs = event.total_jobs,
                    "Session completed"
                );
                true
            }
            Err(e) => {
                error!(
                    session_id = %event.session_id,
                    error = %e,
                    "Session completed but the event could not be published"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventBusError;
    use crate::events::BroadcastEventBus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FailingBus;

    #[async_trait]
    impl EventBus for FailingBus {
        async fn publish(
            &self,
            _event_name: &str,
            _payload: serde_json::Value,
        ) -> Result<(), EventBusError> {
            Err(EventBusError::ConnectionFailed("bus down".to_string()))
        }
    }

    fn manager_with_bus(bus: Arc<dyn EventBus>) -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(
            store.clone(),
            KeySpace::new("test"),
            Duration::from_secs(60),
            bus,
            Duration::from_secs(10),
        );
        (store, manager)
    }

    fn job(id: &str, session: &str) -> Job {
        Job::new(id, "rasterizer", "team-a", serde_json::Value::Null).with_session(session)
    }

    #[tokio::test]
    async fn test_three_job_session_completes_once() {
        let bus = Arc::new(BroadcastEventBus::new(8));
        let mut rx = bus.subscribe();
        let (_, manager) = manager_with_bus(bus.clone());

        let record = SessionRecord::new("s1", "team-a", "rasterizer", 3)
            .with_metadata(serde_json::json!({"frames": [1, 2, 3]}));
        assert!(manager.initialize_session(&record).await.unwrap());

        assert_eq!(
            manager.check_and_cleanup_session(&job("j1", "s1")).await.unwrap(),
            CleanupOutcome::Pending { remaining: 2 }
        );
        assert_eq!(
            manager.check_and_cleanup_session(&job("j2", "s1")).await.unwrap(),
            CleanupOutcome::Pending { remaining: 1 }
        );

        match manager.check_and_cleanup_session(&job("j3", "s1")).await.unwrap() {
            CleanupOutcome::Cleaned { event, published } => {
                assert!(published);
                assert_eq!(event.total_jobs, 3);
                assert_eq!(event.start_time, record.start_time);
            }
            other => panic!("expected cleaned, got {:?}", other),
        }

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.event, SESSION_COMPLETED_EVENT);
        assert_eq!(delivered.payload["total_jobs"], 3);
        assert_eq!(delivered.payload["metadata"]["frames"][2], 3);
        assert!(rx.try_recv().is_err());

        assert!(manager.get_session("s1").await.unwrap().is_none());
        assert!(manager.remaining("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_session_rejected() {
        let (_, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        let err = manager
            .initialize_session(&SessionRecord::new("s0", "t", "q", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::EmptySession(id) if id == "s0"));
    }

    #[tokio::test]
    async fn test_reinitialize_keeps_existing_record() {
        let (_, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        manager
            .initialize_session(&SessionRecord::new("s1", "t", "q", 2))
            .await
            .unwrap();

        let again = manager
            .initialize_session(&SessionRecord::new("s1", "t", "q", 9))
            .await
            .unwrap();

        assert!(!again);
        assert_eq!(manager.remaining("s1").await.unwrap(), Some(2));
        assert_eq!(manager.get_session("s1").await.unwrap().unwrap().total_jobs, 2);
    }

    #[tokio::test]
    async fn test_job_without_session_is_ignored() {
        let (_, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        let job = Job::new("j1", "q", "t", serde_json::Value::Null);

        assert_eq!(
            manager.check_and_cleanup_session(&job).await.unwrap(),
            CleanupOutcome::NotSessioned
        );
    }

    #[tokio::test]
    async fn test_unknown_session_is_missing() {
        let (_, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        assert_eq!(
            manager.check_and_cleanup_session(&job("j1", "ghost")).await.unwrap(),
            CleanupOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_recently_cleaned_session_short_circuits() {
        let (_, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        manager
            .initialize_session(&SessionRecord::new("s1", "t", "q", 1))
            .await
            .unwrap();

        let first = manager.check_and_cleanup_session(&job("j1", "s1")).await.unwrap();
        assert!(matches!(first, CleanupOutcome::Cleaned { .. }));

        assert_eq!(
            manager.check_and_cleanup_session(&job("j1", "s1")).await.unwrap(),
            CleanupOutcome::AlreadyCleaning
        );
    }

    #[tokio::test]
    async fn test_reused_session_id_is_tracked_again() {
        let (_, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        let record = SessionRecord::new("s1", "t", "q", 1);

        manager.initialize_session(&record).await.unwrap();
        manager.check_and_cleanup_session(&job("j1", "s1")).await.unwrap();

        manager.initialize_session(&record).await.unwrap();
        let outcome = manager.check_and_cleanup_session(&job("j2", "s1")).await.unwrap();
        assert!(matches!(outcome, CleanupOutcome::Cleaned { .. }));
    }

    #[tokio::test]
    async fn test_recent_cleanup_never_skips_a_live_counter() {
        let store = Arc::new(MemoryStore::new());
        let manager = |store: &Arc<MemoryStore>| {
            SessionManager::new(
                store.clone(),
                KeySpace::new("test"),
                Duration::from_secs(60),
                Arc::new(BroadcastEventBus::default()),
                Duration::from_secs(10),
            )
        };
        let (first, second) = (manager(&store), manager(&store));
        let record = SessionRecord::new("s1", "t", "q", 1);

        first.initialize_session(&record).await.unwrap();
        first.check_and_cleanup_session(&job("j1", "s1")).await.unwrap();

        // Another process reuses the id while `first` still remembers it.
        assert!(second.initialize_session(&record).await.unwrap());
        let outcome = first.check_and_cleanup_session(&job("j2", "s1")).await.unwrap();

        assert!(matches!(outcome, CleanupOutcome::Cleaned { .. }));
        assert!(first.remaining("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_still_cleans() {
        let (_, manager) = manager_with_bus(Arc::new(FailingBus));
        manager
            .initialize_session(&SessionRecord::new("s1", "t", "q", 1))
            .await
            .unwrap();

        match manager.check_and_cleanup_session(&job("j1", "s1")).await.unwrap() {
            CleanupOutcome::Cleaned { published, .. } => assert!(!published),
            other => panic!("expected cleaned, got {:?}", other),
        }
        assert!(manager.get_session("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_record_publishes_degraded_event() {
        let (store, manager) = manager_with_bus(Arc::new(BroadcastEventBus::default()));
        manager
            .initialize_session(&SessionRecord::new("s1", "team-a", "rasterizer", 1))
            .await
            .unwrap();
        store.delete(&KeySpace::new("test").session("s1")).await.unwrap();

        match manager.check_and_cleanup_session(&job("j1", "s1")).await.unwrap() {
            CleanupOutcome::Cleaned { event, .. } => {
                assert_eq!(event.total_jobs, 0);
                assert_eq!(event.team_id, "team-a");
                assert!(event.metadata.is_null());
                assert_eq!(event.start_time, event.completed_at);
            }
            other => panic!("expected cleaned, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_completions_clean_exactly_once() {
        let bus = Arc::new(BroadcastEventBus::new(64));
        let mut rx = bus.subscribe();
        let (_, manager) = manager_with_bus(bus.clone());
        manager
            .initialize_session(&SessionRecord::new("s1", "t", "rasterizer", 20))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .check_and_cleanup_session(&job(&format!("j{}", i), "s1"))
                    .await
                    .unwrap()
            }));
        }

        let mut cleaned = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), CleanupOutcome::Cleaned { .. }) {
                cleaned += 1;
            }
        }

        assert_eq!(cleaned, 1);
        assert!(rx.recv().await.is_ok());
        assert!(rx.try_recv().is_err());
    }
}
