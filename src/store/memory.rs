//! In-process implementation of the store port.
//!
//! Every operation takes the single state lock once, so each call is as
//! indivisible as its Redis counterpart. String keys expire lazily: an
//! expired entry is dropped the next time anything touches it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ListPush, QueueStore, SessionDecrement};
use crate::error::StoreError;

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    /// Front is the head (push side), back is the tail (pop side).
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl State {
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| e.is_expired(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn pop_tail_push_head(&mut self, source: &str, destination: &str) -> Option<String> {
        let item = self.lists.get_mut(source)?.pop_back()?;
        if self.lists.get(source).is_some_and(VecDeque::is_empty) {
            self.lists.remove(source);
        }
        self.lists
            .entry(destination.to_string())
            .or_default()
            .push_front(item.clone());
        Some(item)
    }

    fn remove_one(&mut self, key: &str, item: &str) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        let Some(index) = list.iter().position(|v| v == item) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            self.lists.remove(key);
        }
        true
    }
}

/// In-memory [`QueueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_batch(&self, pushes: &[ListPush]) -> Result<(), StoreError> {
        {
            let mut state = self.state()?;
            for push in pushes.iter().filter(|p| !p.values.is_empty()) {
                let list = state.lists.entry(push.key.clone()).or_default();
                for value in &push.values {
                    list.push_front(value.clone());
                }
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn move_one(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, StoreError> {
        let Some(timeout) = timeout else {
            return Ok(self.state()?.pop_tail_push_head(source, destination));
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before looking, so a push landing between the
            // check and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let moved = self.state()?.pop_tail_push_head(source, destination);
            if let Some(item) = moved {
                return Ok(Some(item));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue(
        &self,
        queue: &str,
        processing: &str,
        item: &str,
    ) -> Result<bool, StoreError> {
        let removed = {
            let mut state = self.state()?;
            let removed = state.remove_one(processing, item);
            state
                .lists
                .entry(queue.to_string())
                .or_default()
                .push_front(item.to_string());
            removed
        };
        self.pushed.notify_waiters();
        Ok(removed)
    }

    async fn ack(&self, processing: &str, item: &str) -> Result<bool, StoreError> {
        Ok(self.state()?.remove_one(processing, item))
    }

    async fn list_lengths(&self, keys: &[&str]) -> Result<Vec<usize>, StoreError> {
        let state = self.state()?;
        Ok(keys
            .iter()
            .map(|key| state.lists.get(*key).map_or(0, VecDeque::len))
            .collect())
    }

    async fn list_items(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.state()?.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state()?.live_string(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.strings.remove(key);
        state.lists.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut state = self.state()?;
        let current = match state.live_string(key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|_| {
                StoreError::Backend(format!("value at '{}' is not an integer", key))
            })?,
            None => 0,
        };

        let next = current + 1;
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(next)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.state()?
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn init_session(
        &self,
        record_key: &str,
        counter_key: &str,
        record: &str,
        total: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let expires_at = Some(Instant::now() + ttl);

        let created = state.live_string(record_key).is_none();
        if created {
            state.strings.insert(
                record_key.to_string(),
                StringEntry {
                    value: record.to_string(),
                    expires_at,
                },
            );
        }
        if state.live_string(counter_key).is_none() {
            state.strings.insert(
                counter_key.to_string(),
                StringEntry {
                    value: total.to_string(),
                    expires_at,
                },
            );
        }
        Ok(created)
    }

    async fn decrement_session(
        &self,
        record_key: &str,
        counter_key: &str,
    ) -> Result<SessionDecrement, StoreError> {
        let mut state = self.state()?;

        let Some(counter) = state.live_string(counter_key) else {
            return Ok(SessionDecrement::Missing);
        };
        let remaining = counter.value.parse::<i64>().map_err(|_| {
            StoreError::Backend(format!("value at '{}' is not an integer", counter_key))
        })? - 1;

        if remaining <= 0 {
            let record = state.live_string(record_key).map(|e| e.value.clone());
            state.strings.remove(record_key);
            state.strings.remove(counter_key);
            return Ok(SessionDecrement::Cleaned { record });
        }

        if let Some(entry) = state.strings.get_mut(counter_key) {
            entry.value = remaining.to_string();
        }
        Ok(SessionDecrement::Pending { remaining })
    }
}
