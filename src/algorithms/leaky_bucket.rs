//! Leaky bucket rate limiting.
//!
//! Requests pour one unit of water into the client's bucket, which drains
//! continuously at `requests_per_second / window_size` units per second. A
//! request that finds the bucket full (`burst_capacity`) is denied.

use super::{
    optimistic_update, whole_seconds, Decision, DenyReason, LimitParams, QuotaSnapshot,
    RateLimitAlgorithm,
};
use crate::error::Result;
use crate::store::StateStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    pub water_level: f64,
    pub last_leak: u64,
}

pub struct LeakyBucketLimiter {
    store: Arc<dyn StateStore>,
    params: LimitParams,
}

impl LeakyBucketLimiter {
    pub const NAME: &'static str = "leaky-bucket";
    const KEY_SEGMENT: &'static str = "leaky_bucket";

    pub fn new(store: Arc<dyn StateStore>, params: LimitParams) -> Self {
        Self { store, params }
    }

    fn state_key(&self, client_key: &str) -> String {
        self.params.state_key(Self::KEY_SEGMENT, client_key)
    }

    /// Units drained per millisecond.
    fn leak_per_ms(&self) -> f64 {
        self.params.requests_per_second / self.params.window_size.as_secs_f64() / 1000.0
    }

    /// Apply one request to `state` at `now`.
    pub fn step(&self, state: Option<LeakyBucketState>, now: u64) -> (Decision, LeakyBucketState) {
        let capacity = self.params.burst_capacity as f64;
        let leak_per_ms = self.leak_per_ms();

        let state = state.unwrap_or(LeakyBucketState {
            water_level: 0.0,
            last_leak: now,
        });
        let elapsed_ms = now.saturating_sub(state.last_leak) as f64;
        let level = (state.water_level - leak_per_ms * elapsed_ms).max(0.0);

        let snapshot = |level: f64| QuotaSnapshot {
            limit: self.params.burst_capacity,
            remaining: (capacity - level).max(0.0).floor() as u64,
            reset_at_millis: now + (level / leak_per_ms).ceil() as u64,
        };

        if level < capacity {
            let next = LeakyBucketState {
                water_level: level + 1.0,
                last_leak: now,
            };
            (Decision::Admitted(snapshot(next.water_level)), next)
        } else {
            let wait_ms = ((level - capacity) / leak_per_ms).ceil() as u64 + 1;
            (
                Decision::Denied {
                    reason: DenyReason::LeakyBucketOverflow,
                    retry_after: whole_seconds(wait_ms),
                    quota: snapshot(level),
                },
                LeakyBucketState {
                    water_level: level,
                    last_leak: now,
                },
            )
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for LeakyBucketLimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn limit(&self) -> u64 {
        self.params.burst_capacity
    }

    async fn check(&self, client_key: &str, now: u64) -> Result<Decision> {
        if !self.params.is_usable() {
            return Ok(Decision::misconfigured(&self.params, now));
        }

        let key = self.state_key(client_key);
        let decision = optimistic_update(
            self.store.as_ref(),
            &key,
            self.params.state_ttl,
            self.params.max_attempts,
            |state| self.step(state, now),
        )
        .await?;

        trace!(key = %key, admitted = decision.is_admitted(), "Leaky bucket checked");
        Ok(decision)
    }

    async fn reset(&self, client_key: &str, _now: u64) -> Result<()> {
        self.store.delete(&self.state_key(client_key)).await?;
        Ok(())
    }
}
