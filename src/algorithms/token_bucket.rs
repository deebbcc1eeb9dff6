//! Token bucket rate limiting.
//!
//! Each client holds up to `burst_capacity` whole tokens, refilled at
//! `requests_per_second`. A request takes one token; an empty bucket denies.
//! New clients start with a full bucket.

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: u64,
    /// Unix millis of the last request that touched the bucket.
    pub last_refill: u64,
}

impl TokenBucketState {
    pub fn full(capacity: u64, now: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Credit whole tokens earned since `last_refill` and restart the refill
    /// clock at `now`. Partial progress toward the next token is dropped, so
    /// traffic above the rate never accumulates credit. A refill clock ahead
    /// of `now` credits nothing.
    pub fn refill(self, now: u64, rate: f64, capacity: u64) -> Self {
        let earned = if self.last_refill >= now {
            0
        } else {
            ((now - self.last_refill) as f64 * rate / 1000.0).floor() as u64
        };

        Self {
            tokens: self.tokens.saturating_add(earned).min(capacity),
            last_refill: now,
        }
    }
}

pub struct TokenBucketLimiter {
    store: Arc<dyn StateStore>,
    params: LimitParams,
}

impl TokenBucketLimiter {
    pub const NAME: &'static str = "token-bucket";
    const KEY_SEGMENT: &'static str = "token_bucket";

    pub fn new(store: Arc<dyn StateStore>, params: LimitParams) -> Self {
        Self { store, params }
    }

    fn state_key(&self, client_key: &str) -> String {
        self.params.state_key(Self::KEY_SEGMENT, client_key)
    }

    /// Apply one request to `state` at `now`.
    pub fn step(&self, state: Option<TokenBucketState>, now: u64) -> (Decision, TokenBucketState) {
        let rate = self.params.requests_per_second;
        let capacity = self.params.burst_capacity;

        let refilled = state
            .unwrap_or_else(|| TokenBucketState::full(capacity, now))
            .refill(now, rate, capacity);

        let ms_per_token = 1000.0 / rate;
        let snapshot = |tokens: u64, last_refill: u64| QuotaSnapshot {
            limit: capacity,
            remaining: tokens,
            reset_at_millis: last_refill
                + ((capacity - tokens) as f64 * ms_per_token).ceil() as u64,
        };

        if refilled.tokens >= 1 {
            let next = TokenBucketState {
                tokens: refilled.tokens - 1,
                last_refill: refilled.last_refill,
            };
            (
                Decision::Admitted(snapshot(next.tokens, next.last_refill)),
                next,
            )
        } else {
            let next_token_at = refilled.last_refill + ms_per_token.ceil() as u64;
            (
                Decision::Denied {
                    reason: DenyReason::TokenBucketEmpty,
                    retry_after: whole_seconds(next_token_at.saturating_sub(now)),
                    quota: snapshot(0, refilled.last_refill),
                },
                refilled,
            )
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
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

        trace!(key = %key, remaining = decision.quota().remaining, "Token bucket checked");
        Ok(decision)
    }

    async fn reset(&self, client_key: &str, _now: u64) -> Result<()> {
        self.store.delete(&self.state_key(client_key)).await?;
        Ok(())
    }
}
