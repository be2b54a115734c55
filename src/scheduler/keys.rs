//! Store key layout.
//!
//! Every key lives under a configurable prefix:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `{prefix}:queue:{queue_type}` | list | regular lane |
//! | `{prefix}:queue:{queue_type}:priority` | list | priority lane |
//! | `{prefix}:queue:{queue_type}:processing` | list | checked-out jobs |
//! | `{prefix}:job:{job_id}:status` | string | `JobStatus` JSON, TTL |
//! | `{prefix}:job:{job_id}:retries` | string | attempt counter, TTL |
//! | `{prefix}:team:{team_id}:jobs` | set | job ids |
//! | `{prefix}:session:{session_id}` | string | `SessionRecord` JSON, TTL |
//! | `{prefix}:session:{session_id}:remaining` | string | counter, TTL |

use serde::{Deserialize, Serialize};

/// The three list keys backing one queue type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKeySet {
    /// Queue type these keys were derived from.
    pub queue_type: String,
    /// Regular lane.
    pub queue_key: String,
    /// Priority lane.
    pub priority_queue_key: String,
    /// Jobs checked out by workers.
    pub processing_key: String,
}

/// Derives every key the scheduler uses from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Lane and processing keys for a queue type.
    pub fn queue(&self, queue_type: &str) -> QueueKeySet {
        let queue_key = format!("{}:queue:{}", self.prefix, queue_type);
        QueueKeySet {
            queue_type: queue_type.to_string(),
            priority_queue_key: format!("{}:priority", queue_key),
            processing_key: format!("{}:processing", queue_key),
            queue_key,
        }
    }

    pub fn status(&self, job_id: &str) -> String {
        format!("{}:job:{}:status", self.prefix, job_id)
    }

    pub fn retries(&self, job_id: &str) -> String {
        format!("{}:job:{}:retries", self.prefix, job_id)
    }

    pub fn team_jobs(&self, team_id: &str) -> String {
        format!("{}:team:{}:jobs", self.prefix, team_id)
    }

    pub fn session(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    pub fn session_remaining(&self, session_id: &str) -> String {
        format!("{}:session:{}:remaining", self.prefix, session_id)
    }

    /// Pub/sub channel for published events.
    pub fn events_channel(&self) -> String {
        format!("{}:events", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_KEY_PREFIX)
    }
}
