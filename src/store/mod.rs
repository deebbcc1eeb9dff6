//! Shared state access for rate limiting algorithms.
//!
//! The store exposes only atomic primitives. Algorithms that keep structured
//! state run a read, compute, compare-and-set cycle and retry on conflict;
//! nothing here offers an unconditional overwrite.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Create `key` with `value` only if it does not exist yet.
    ///
    /// Returns `false` when another writer created it first.
    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Replace the value at `key` only if it still equals `expected`.
    ///
    /// Returns `false` when the key changed (or vanished) since it was read.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Add `delta` to the integer counter at `key` and return the new value.
    ///
    /// A missing key starts at zero and receives `ttl`; an existing key keeps
    /// its expiry. Non-integer content yields `LimiterError::MalformedState`.
    async fn atomic_increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Remove `key`. Used by administrative resets only.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Round-trip check used by health reporting.
    async fn ping(&self) -> Result<()>;
}
