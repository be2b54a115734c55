//! Short-lived, process-local set of keys.
//!
//! Backed by a sharded [`DashMap`], so concurrent workers touching different
//! sessions do not contend on one lock. Entries carry their own expiry and are
//! swept opportunistically on insert; no timers are spawned.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A set whose members disappear `window` after insertion.
#[derive(Debug)]
pub struct ExpiringSet {
    entries: DashMap<String, Instant>,
    window: Duration,
}

impl ExpiringSet {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Inserts `key` unless a live entry already exists.
    ///
    /// Returns `true` if this call inserted it.
    pub fn insert(&self, key: &str) -> bool {
        let now = Instant::now();
        self.sweep(now);

        let mut inserted = false;
        self.entries
            .entry(key.to_string())
            .and_modify(|expires_at| {
                if *expires_at <= now {
                    *expires_at = now + self.window;
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                now + self.window
            });
        inserted
    }

    /// Returns whether `key` is present and not yet expired.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }

    /// Drops `key` before its window elapses.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self, now: Instant) {
        self.entries.retain(|_, expires_at| *expires_at > now);
    }
}
