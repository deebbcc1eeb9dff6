//! Fixed window counter rate limiting.
//!
//! Time is cut into windows of `window_size`; each (client, window) pair gets
//! its own counter, incremented atomically on every request. Requests beyond
//! `requests_per_second * window_size` in a window are denied, and denied
//! requests still count.
//!
//! A client may spend a full window's allowance at the end of one window and
//! again at the start of the next. That double burst is inherent to the
//! algorithm.

use super::{whole_seconds, Decision, DenyReason, LimitParams, QuotaSnapshot, RateLimitAlgorithm};
use crate::error::{LimiterError, Result};
use crate::store::StateStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

pub struct FixedWindowLimiter {
    store: Arc<dyn StateStore>,
    params: LimitParams,
}

impl FixedWindowLimiter {
    pub const NAME: &'static str = "fixed-window";
    const KEY_SEGMENT: &'static str = "fixed_window";

    pub fn new(store: Arc<dyn StateStore>, params: LimitParams) -> Self {
        Self { store, params }
    }

    pub fn window_id(&self, now: u64) -> u64 {
        now / self.params.window_millis()
    }

    fn window_key(&self, client_key: &str, window_id: u64) -> String {
        format!(
            "{}:{}",
            self.params.state_key(Self::KEY_SEGMENT, client_key),
            window_id
        )
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        match self
            .store
            .atomic_increment(key, 1, self.params.window_size)
            .await
        {
            Err(LimiterError::MalformedState { .. }) => {
                warn!(key = %key, "Discarding malformed window counter");
                self.store.delete(key).await?;
                self.store
                    .atomic_increment(key, 1, self.params.window_size)
                    .await
            }
            other => other,
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
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

        let window_id = self.window_id(now);
        let key = self.window_key(client_key, window_id);
        let count = self.increment(&key).await?.max(0) as u64;

        let limit = self.params.window_limit();
        let reset_at_millis = (window_id + 1) * self.params.window_millis();
        let quota = QuotaSnapshot {
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_millis,
        };

        trace!(key = %key, count = count, limit = limit, "Fixed window checked");

        if count > limit {
            Ok(Decision::Denied {
                reason: DenyReason::FixedWindowExceeded,
                retry_after: whole_seconds(reset_at_millis.saturating_sub(now)),
                quota,
            })
        } else {
            Ok(Decision::Admitted(quota))
        }
    }

    async fn reset(&self, client_key: &str, now: u64) -> Result<()> {
        let key = self.window_key(client_key, self.window_id(now));
        self.store.delete(&key).await?;
        Ok(())
    }
}
