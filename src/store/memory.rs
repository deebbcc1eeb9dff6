//! In-process state store.
//!
//! Every operation runs under one mutex, so each is atomic with respect to the
//! others. Useful for single-instance deployments and tests; state is not
//! shared between processes.
//!
//! Expired keys are dropped when they are next touched, and a full sweep runs
//! once every [`PURGE_INTERVAL`] operations.

use super::StateStore;
use crate::error::{LimiterError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Operations between full sweeps of expired keys.
pub const PURGE_INTERVAL: u64 = 1024;

#[derive(Debug)]
struct Entry {
    value: String,
    /// `None` when the TTL reaches past what the monotonic clock can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, now: Instant, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    operations: u64,
}

impl Entries {
    fn evict_if_expired(&mut self, key: &str, now: Instant) {
        if self.map.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.map.remove(key);
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.map.retain(|_, entry| entry.is_live(now));
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| LimiterError::Internal("Failed to acquire store lock".into()))
    }

    /// Run `f` against the map with `key` already cleared if it has expired.
    fn with_key<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T,
    ) -> Result<T> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        entries.operations = entries.operations.wrapping_add(1);
        if entries.operations % PURGE_INTERVAL == 0 {
            entries.purge_expired(now);
        } else {
            entries.evict_if_expired(key, now);
        }

        Ok(f(&mut entries.map, now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.map.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any live key contains `fragment`.
    pub fn has_key_containing(&self, fragment: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .map(|entries| {
                entries
                    .map
                    .iter()
                    .any(|(k, e)| e.is_live(now) && k.contains(fragment))
            })
            .unwrap_or(false)
    }

    /// Write a raw value, bypassing the atomic contract. Lets tests plant
    /// corrupt or foreign state.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.with_key(key, |entries, now| {
            entries.insert(key.to_string(), Entry::new(value, now, ttl));
        })
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_key(key, |entries, _| entries.get(key).map(|e| e.value.clone()))
    }

    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_key(key, |entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(key.to_string(), Entry::new(value, now, ttl));
            true
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.with_key(key, |entries, now| match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                *entry = Entry::new(new_value, now, ttl);
                true
            }
            _ => false,
        })
    }

    async fn atomic_increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        self.with_key(key, |entries, now| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new("0", now, ttl));
            let current: i64 = entry
                .value
                .parse()
                .map_err(|_| LimiterError::MalformedState { key: key.to_string() })?;
            let next = current.saturating_add(delta);
            entry.value = next.to_string();
            Ok(next)
        })?
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_key(key, |entries, _| entries.remove(key).is_some())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
