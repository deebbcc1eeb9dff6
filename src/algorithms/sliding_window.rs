//! Sliding window log rate limiting.
//!
//! Keeps the timestamp of every admitted request for the client. On each
//! request, timestamps older than `window_size` are pruned and the request is
//! admitted only if fewer than `requests_per_second * window_size` remain.

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

/// Admission timestamps (Unix millis), ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowLog {
    pub timestamps: Vec<u64>,
}

impl SlidingWindowLog {
    /// Drop entries more than `window_ms` older than `now`.
    pub fn prune(&mut self, now: u64, window_ms: u64) {
        self.timestamps
            .retain(|&ts| now.saturating_sub(ts) <= window_ms);
    }

    /// Insert keeping ascending order even when clocks disagree.
    pub fn record(&mut self, now: u64) {
        let at = self.timestamps.partition_point(|&ts| ts <= now);
        self.timestamps.insert(at, now);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

pub struct SlidingWindowLimiter {
    store: Arc<dyn StateStore>,
    params: LimitParams,
}

impl SlidingWindowLimiter {
    pub const NAME: &'static str = "sliding-window";
    const KEY_SEGMENT: &'static str = "sliding_window";

    pub fn new(store: Arc<dyn StateStore>, params: LimitParams) -> Self {
        Self { store, params }
    }

    fn state_key(&self, client_key: &str) -> String {
        self.params.state_key(Self::KEY_SEGMENT, client_key)
    }

    /// Stored entries are capped at twice the window limit.
    fn max_log_len(&self) -> usize {
        (self.params.window_limit() as usize).saturating_mul(2)
    }

    /// Apply one request to `state` at `now`.
    pub fn step(&self, state: Option<SlidingWindowLog>, now: u64) -> (Decision, SlidingWindowLog) {
        let window_ms = self.params.window_millis();
        let limit = self.params.window_limit();

        let mut log = state.unwrap_or_default();
        log.prune(now, window_ms);

        let cap = self.max_log_len();
        if log.len() > cap {
            let excess = log.len() - cap;
            log.timestamps.drain(..excess);
        }

        let snapshot = |log: &SlidingWindowLog| QuotaSnapshot {
            limit,
            remaining: limit.saturating_sub(log.len() as u64),
            reset_at_millis: log
                .timestamps
                .last()
                .map(|ts| ts + window_ms + 1)
                .unwrap_or(now),
        };

        if (log.len() as u64) < limit {
            log.record(now);
            (Decision::Admitted(snapshot(&log)), log)
        } else {
            // The entry whose expiry brings the count back under the limit.
            let frees_slot_at = log
                .len()
                .checked_sub(limit as usize)
                .and_then(|i| log.timestamps.get(i))
                .map(|ts| ts + window_ms + 1);
            let wait_ms = match frees_slot_at {
                Some(at) => at.saturating_sub(now),
                None => window_ms,
            };
            (
                Decision::Denied {
                    reason: DenyReason::SlidingWindowExceeded,
                    retry_after: whole_seconds(wait_ms),
                    quota: snapshot(&log),
                },
                log,
            )
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn limit(&self) -> u64 {
        self.params.window_limit()
    }

    async fn check(&self, client_key: &str, now: u64) -> Result<Decision> {
        if !self.params.is_usable() {
            return Ok(Decision::misconfigured(&self.params, now));
        }

        let key = self.state_key(client_key);
        let ttl = self.params.state_ttl.max(self.params.window_size);
        let decision = optimistic_update(
            self.store.as_ref(),
            &key,
            ttl,
            self.params.max_attempts,
            |state| self.step(state, now),
        )
        .await?;

        trace!(key = %key, remaining = decision.quota().remaining, "Sliding window checked");
        Ok(decision)
    }

    async fn reset(&self, client_key: &str, _now: u64) -> Result<()> {
        self.store.delete(&self.state_key(client_key)).await?;
        Ok(())
    }
}
