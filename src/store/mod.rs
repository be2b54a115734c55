//! Store port used by every scheduler component.
//!
//! The scheduler never talks to a concrete client. All shared state (lane
//! lists, processing lists, status and retry keys, team sets, session records)
//! goes through [`QueueStore`], whose operations are each indivisible on the
//! backend:
//!
//! - [`RedisStore`]: `BRPOPLPUSH`/`RPOPLPUSH`, pipelines and Lua scripts
//! - [`MemoryStore`]: a single mutex per operation, used by tests and
//!   embedded single-process deployments

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Values to push onto the head of one list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPush {
    /// Target list key.
    pub key: String,
    /// Values in push order; the last value ends up at the head.
    pub values: Vec<String>,
}

impl ListPush {
    pub fn new(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}

/// Result of the atomic decrement-and-check on a session counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecrement {
    /// The counter is still above zero after the decrement.
    Pending { remaining: i64 },
    /// This call took the counter to zero or below; record and counter are gone.
    Cleaned { record: Option<String> },
    /// No counter exists (never initialized, expired, or already cleaned).
    Missing,
}

/// Primitive operations the scheduler needs from its backing store.
///
/// Lists have a head (left, where pushes land) and a tail (right, where pops
/// are taken from).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Pushes every batch onto the head of its list in one round-trip.
    async fn push_batch(&self, pushes: &[ListPush]) -> Result<(), StoreError>;

    /// Moves one item from the tail of `source` to the head of `destination`.
    ///
    /// With `Some(timeout)` the call blocks up to `timeout` when `source` is
    /// empty; with `None` it returns immediately.
    async fn move_one(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, StoreError>;

    /// Removes one occurrence of `item` from `processing` and pushes it onto
    /// the head of `queue`. Returns whether the item was found in `processing`.
    async fn requeue(&self, queue: &str, processing: &str, item: &str)
        -> Result<bool, StoreError>;

    /// Removes one occurrence of `item` from `processing`.
    async fn ack(&self, processing: &str, item: &str) -> Result<bool, StoreError>;

    /// Returns the length of each list, in order.
    async fn list_lengths(&self, keys: &[&str]) -> Result<Vec<usize>, StoreError>;

    /// Returns every item of a list, head first.
    async fn list_items(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Writes a string value, replacing any previous value and TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increments a counter and re-applies its TTL.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Writes a session record and its remaining counter, both with `ttl`.
    ///
    /// The two writes are batched but not transactional. Existing keys are left
    /// untouched. Returns whether the record was newly written.
    async fn init_session(
        &self,
        record_key: &str,
        counter_key: &str,
        record: &str,
        total: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Decrements a session counter and, when it reaches zero, reads and
    /// deletes the record and counter in the same indivisible step.
    async fn decrement_session(
        &self,
        record_key: &str,
        counter_key: &str,
    ) -> Result<SessionDecrement, StoreError>;
}

/// Converts a TTL to whole seconds, rounding sub-second values up to one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }

    #[test]
    fn test_list_push_new() {
        let push = ListPush::new("q", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(push.key, "q");
        assert_eq!(push.values.len(), 2);
    }
}
