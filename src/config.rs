//! Scheduler configuration.
//!
//! Values default to what a single render farm deployment uses; the CLI
//! overrides them from flags or `FRAMEFLOW_*` environment variables.

use std::time::Duration;

/// Default prefix for every key the scheduler writes.
pub const DEFAULT_KEY_PREFIX: &str = "frameflow";

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration shared by the queue, status, retry and session components.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Prefix for all store keys.
    pub key_prefix: String,
    /// Lifetime of a job status entry, refreshed on every write.
    pub status_ttl: Duration,
    /// Lifetime of a retry counter, refreshed on every increment.
    pub retry_ttl: Duration,
    /// Safety-net lifetime of a session record and its counter.
    pub session_ttl: Duration,
    /// How long an idle fetch blocks waiting for work.
    pub fetch_timeout: Duration,
    /// How long a cleaned session id stays in the in-process de-dup set.
    pub dedup_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            status_ttl: DAY,
            retry_ttl: DAY,
            session_ttl: DAY,
            fetch_timeout: Duration::from_secs(1),
            dedup_window: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the job status TTL.
    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Sets the retry counter TTL.
    pub fn with_retry_ttl(mut self, ttl: Duration) -> Self {
        self.retry_ttl = ttl;
        self
    }

    /// Sets the session TTL.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sets the blocking fetch timeout. `Duration::ZERO` disables blocking.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the session de-dup window.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }
}
