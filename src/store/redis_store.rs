//! Redis implementation of the store port.
//!
//! # Atomicity
//!
//! - Lane moves use `RPOPLPUSH`/`BRPOPLPUSH`, so an item is always in exactly
//!   one of the two lists.
//! - Requeue, retry increment and the session decrement-and-check run as Lua
//!   scripts, which Redis executes without interleaving other commands.
//! - Batch pushes and session initialization are plain pipelines: one
//!   round-trip, not transactional.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use tracing::debug;

use super::{ttl_secs, ListPush, QueueStore, SessionDecrement};
use crate::error::StoreError;

const REQUEUE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[2], 1, ARGV[1])
redis.call('LPUSH', KEYS[1], ARGV[1])
return removed
"#;

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return count
"#;

const DECREMENT_SESSION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return {'missing'}
end
local remaining = redis.call('DECR', KEYS[2])
if remaining <= 0 then
    local record = redis.call('GET', KEYS[1])
    redis.call('DEL', KEYS[1], KEYS[2])
    if record then
        return {'cleaned', record}
    end
    return {'cleaned', ''}
end
return {'pending', tostring(remaining)}
"#;

/// Redis-backed [`QueueStore`].
///
/// Non-blocking commands share one [`ConnectionManager`] (which reconnects
/// automatically). A blocked connection stalls every other caller sharing it,
/// so each blocking move checks out a dedicated connection from a small idle
/// list and hands it back afterwards. The list grows to the number of
/// concurrent blocking callers; a connection that errors is dropped.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    redis: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    requeue_script: Script,
    increment_script: Script,
    decrement_session_script: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            Client::open(redis_url).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_parts(client, redis))
    }

    /// Builds a store from an existing client and connection manager.
    ///
    /// Useful when the connection is shared with other components such as
    /// the Redis event bus.
    pub fn from_parts(client: Client, redis: ConnectionManager) -> Self {
        Self {
            client,
            redis,
            blocking: Arc::new(Mutex::new(Vec::new())),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            increment_script: Script::new(INCREMENT_SCRIPT),
            decrement_session_script: Script::new(DECREMENT_SESSION_SCRIPT),
        }
    }

    /// Returns a handle to the shared connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self.idle_blocking()?.pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) -> Result<(), StoreError> {
        self.idle_blocking()?.push(conn);
        Ok(())
    }

    fn idle_blocking(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Vec<MultiplexedConnection>>, StoreError> {
        self.blocking
            .lock()
            .map_err(|_| StoreError::Backend("blocking connection list poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_batch(&self, pushes: &[ListPush]) -> Result<(), StoreError> {
        let mut pipe = ::redis::pipe();
        let mut commands = 0;
        for push in pushes.iter().filter(|p| !p.values.is_empty()) {
            pipe.lpush(&push.key, &push.values).ignore();
            commands += 1;
        }
        if commands == 0 {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn move_one(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, StoreError> {
        match timeout {
            None => {
                let mut conn = self.redis.clone();
                let item: Option<String> = ::redis::cmd("RPOPLPUSH")
                    .arg(source)
                    .arg(destination)
                    .query_async(&mut conn)
                    .await?;
                Ok(item)
            }
            Some(timeout) => {
                let mut conn = self.checkout_blocking().await?;
                let timeout_secs = timeout.as_secs().max(1) as usize;

                let item: Option<String> = ::redis::cmd("BRPOPLPUSH")
                    .arg(source)
                    .arg(destination)
                    .arg(timeout_secs)
                    .query_async(&mut conn)
                    .await?;
                self.checkin_blocking(conn)?;
                Ok(item)
            }
        }
    }

    async fn requeue(
        &self,
        queue: &str,
        processing: &str,
        item: &str,
    ) -> Result<bool, StoreError> {
        let removed: i64 = self
            .requeue_script
            .key(queue)
            .key(processing)
            .arg(item)
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn ack(&self, processing: &str, item: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.lrem(processing, 1, item).await?;
        Ok(removed > 0)
    }

    async fn list_lengths(&self, keys: &[&str]) -> Result<Vec<usize>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for key in keys {
            pipe.llen(*key);
        }

        let mut conn = self.redis.clone();
        let lengths: Vec<usize> = pipe.query_async(&mut conn).await?;
        Ok(lengths)
    }

    async fn list_items(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let items: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(items)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let count: i64 = self
            .increment_script
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(count)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn init_session(
        &self,
        record_key: &str,
        counter_key: &str,
        record: &str,
        total: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let secs = ttl_secs(ttl);

        let mut pipe = ::redis::pipe();
        pipe.cmd("SET")
            .arg(record_key)
            .arg(record)
            .arg("EX")
            .arg(secs)
            .arg("NX")
            .cmd("SET")
            .arg(counter_key)
            .arg(total)
            .arg("EX")
            .arg(secs)
            .arg("NX")
            .ignore();

        let mut conn = self.redis.clone();
        let created: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(matches!(created.first(), Some(Some(_))))
    }

    async fn decrement_session(
        &self,
        record_key: &str,
        counter_key: &str,
    ) -> Result<SessionDecrement, StoreError> {
        let reply: Vec<String> = self
            .decrement_session_script
            .key(record_key)
            .key(counter_key)
            .invoke_async(&mut self.redis.clone())
            .await?;

        let outcome = parse_session_reply(&reply)?;
        debug!(counter_key = counter_key, outcome = ?outcome, "Session counter decremented");
        Ok(outcome)
    }
}

/// Decodes the reply of the decrement-and-check script.
fn parse_session_reply(reply: &[String]) -> Result<SessionDecrement, StoreError> {
    match reply {
        [tag] if tag == "missing" => Ok(SessionDecrement::Missing),
        [tag, remaining] if tag == "pending" => remaining
            .parse()
            .map(|remaining| SessionDecrement::Pending { remaining })
            .map_err(|_| StoreError::UnexpectedReply(format!("{:?}", reply))),
        [tag, record] if tag == "cleaned" => Ok(SessionDecrement::Cleaned {
            record: (!record.is_empty()).then(|| record.clone()),
        }),
        _ => Err(StoreError::UnexpectedReply(format!("{:?}", reply))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_missing() {
        assert_eq!(
            parse_session_reply(&reply(&["missing"])).unwrap(),
            SessionDecrement::Missing
        );
    }

    #[test]
    fn test_parse_pending() {
        assert_eq!(
            parse_session_reply(&reply(&["pending", "2"])).unwrap(),
            SessionDecrement::Pending { remaining: 2 }
        );
    }

    #[test]
    fn test_parse_cleaned_with_and_without_record() {
        assert_eq!(
            parse_session_reply(&reply(&["cleaned", "{\"a\":1}"])).unwrap(),
            SessionDecrement::Cleaned {
                record: Some("{\"a\":1}".to_string())
            }
        );
        assert_eq!(
            parse_session_reply(&reply(&["cleaned", ""])).unwrap(),
            SessionDecrement::Cleaned { record: None }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_session_reply(&reply(&["pending", "two"])),
            Err(StoreError::UnexpectedReply(_))
        ));
        assert!(matches!(
            parse_session_reply(&reply(&[])),
            Err(StoreError::UnexpectedReply(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Needs Redis at REDIS_URL
    async fn test_blocking_moves_reuse_one_connection() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let store = RedisStore::connect(&url).await.unwrap();
        let prefix = format!("frameflow-test-{}", uuid::Uuid::new_v4());
        let (queue, processing) = (format!("{prefix}:q"), format!("{prefix}:p"));

        for _ in 0..3 {
            let moved = store
                .move_one(&queue, &processing, Some(Duration::from_secs(1)))
                .await
                .unwrap();
            assert!(moved.is_none());
        }

        assert_eq!(store.blocking.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_scripts_touch_declared_keys_only() {
        for script in [REQUEUE_SCRIPT, INCREMENT_SCRIPT, DECREMENT_SESSION_SCRIPT] {
            assert!(!script.contains("KEYS[3]"));
        }
    }
}
