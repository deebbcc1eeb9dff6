//! Rate limiting algorithms.
//!
//! Every algorithm implements [`RateLimitAlgorithm`]: given a client key and
//! the current time it decides admit or deny and persists its updated state
//! through the shared [`StateStore`]. One algorithm is selected at startup by
//! [`AlgorithmRegistry::select`]; per request the throttler only calls the
//! selected instance.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use crate::error::{LimiterError, Result};
use crate::store::StateStore;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_ALGORITHM: &str = TokenBucketLimiter::NAME;

/// Parameters shared by all algorithms.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitParams {
    pub requests_per_second: f64,
    pub burst_capacity: u64,
    pub window_size: Duration,
    /// Expiry applied to per-client state so idle clients self-clean.
    pub state_ttl: Duration,
    /// Compare-and-set attempts before giving up on a contended key.
    pub max_attempts: u32,
    pub key_prefix: String,
}

impl Default for LimitParams {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_capacity: 20,
            window_size: Duration::from_secs(60),
            state_ttl: Duration::from_secs(3600),
            max_attempts: 3,
            key_prefix: "rate_limit".to_string(),
        }
    }
}

impl LimitParams {
    /// Rate and capacity must be positive and the window non-empty. Algorithms
    /// built from anything else deny every request.
    pub fn is_usable(&self) -> bool {
        self.requests_per_second.is_finite()
            && self.requests_per_second > 0.0
            && self.burst_capacity > 0
            && !self.window_size.is_zero()
    }

    /// Requests allowed per window for the window-based algorithms. Never
    /// below one, so a rate under one request per window still admits one.
    pub fn window_limit(&self) -> u64 {
        ((self.requests_per_second * self.window_size.as_secs_f64()).floor() as u64).max(1)
    }

    pub fn window_millis(&self) -> u64 {
        (self.window_size.as_millis() as u64).max(1)
    }

    pub fn state_key(&self, algorithm: &str, client_key: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, algorithm, client_key)
    }
}

/// Why a request was rejected. The display form is the machine-readable
/// reason carried in the rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TokenBucketEmpty,
    LeakyBucketOverflow,
    FixedWindowExceeded,
    SlidingWindowExceeded,
    InvalidConfiguration,
    StoreUnavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::TokenBucketEmpty => "token bucket empty",
            DenyReason::LeakyBucketOverflow => "leaky bucket overflow",
            DenyReason::FixedWindowExceeded => "fixed window limit exceeded",
            DenyReason::SlidingWindowExceeded => "sliding window limit exceeded",
            DenyReason::InvalidConfiguration => "rate limit misconfigured",
            DenyReason::StoreUnavailable => "rate limit store unavailable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota figures reported alongside a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub limit: u64,
    pub remaining: u64,
    /// Unix milliseconds at which the quota is fully restored.
    pub reset_at_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted(QuotaSnapshot),
    Denied {
        reason: DenyReason,
        retry_after: Duration,
        quota: QuotaSnapshot,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted(_))
    }

    pub fn quota(&self) -> &QuotaSnapshot {
        match self {
            Decision::Admitted(quota) => quota,
            Decision::Denied { quota, .. } => quota,
        }
    }

    /// The deterministic rejection issued by an algorithm built from unusable
    /// parameters.
    pub(crate) fn misconfigured(params: &LimitParams, now: u64) -> Self {
        Decision::Denied {
            reason: DenyReason::InvalidConfiguration,
            retry_after: params.window_size.max(Duration::from_secs(1)),
            quota: QuotaSnapshot {
                limit: 0,
                remaining: 0,
                reset_at_millis: now,
            },
        }
    }
}

#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Registry name, e.g. `token-bucket`.
    fn name(&self) -> &'static str;

    /// Requests the client is allowed per period, as advertised in headers.
    fn limit(&self) -> u64;

    /// Decide whether the request from `client_key` at `now` (Unix millis) is
    /// admitted, updating the stored state.
    async fn check(&self, client_key: &str, now: u64) -> Result<Decision>;

    /// Forget all state held for `client_key`.
    async fn reset(&self, client_key: &str, now: u64) -> Result<()>;
}

/// Read, compute, compare-and-set, retrying when another writer got there
/// first.
///
/// `step` receives the decoded state (or `None` when absent or undecodable)
/// and returns the decision plus the state to persist.
pub(crate) async fn optimistic_update<S, F>(
    store: &dyn StateStore,
    key: &str,
    ttl: Duration,
    max_attempts: u32,
    mut step: F,
) -> Result<Decision>
where
    S: Serialize + DeserializeOwned,
    F: FnMut(Option<S>) -> (Decision, S),
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let raw = store.get(key).await?;
        let state = match raw.as_deref() {
            Some(stored) => match serde_json::from_str::<S>(stored) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding malformed rate limit state");
                    None
                }
            },
            None => None,
        };

        let (decision, next) = step(state);
        let encoded = serde_json::to_string(&next)?;

        let written = match raw.as_deref() {
            Some(previous) => store.compare_and_set(key, previous, &encoded, ttl).await?,
            None => store.set_if_not_exists(key, &encoded, ttl).await?,
        };
        if written {
            return Ok(decision);
        }

        debug!(key = %key, attempt = attempt, "Rate limit state changed concurrently, retrying");
    }

    Err(LimiterError::Contention {
        key: key.to_string(),
        attempts,
    })
}

/// Whole seconds to wait, rounded up, never less than one.
pub(crate) fn whole_seconds(millis: u64) -> Duration {
    Duration::from_secs(millis.div_ceil(1000).max(1))
}

pub type AlgorithmFactory = fn(Arc<dyn StateStore>, LimitParams) -> Arc<dyn RateLimitAlgorithm>;

/// Maps configured algorithm names to constructors.
pub struct AlgorithmRegistry {
    factories: HashMap<&'static str, AlgorithmFactory>,
}

impl AlgorithmRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(TokenBucketLimiter::NAME, build_token_bucket);
        registry.register(LeakyBucketLimiter::NAME, build_leaky_bucket);
        registry.register(FixedWindowLimiter::NAME, build_fixed_window);
        registry.register(SlidingWindowLimiter::NAME, build_sliding_window);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: AlgorithmFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.factories.contains_key(normalize(name).as_str())
    }

    /// Build the algorithm named `name`. Unknown names fall back to the token
    /// bucket with a warning.
    pub fn select(
        &self,
        name: &str,
        store: Arc<dyn StateStore>,
        params: LimitParams,
    ) -> Arc<dyn RateLimitAlgorithm> {
        let normalized = normalize(name);
        let factory = match self.factories.get(normalized.as_str()) {
            Some(factory) => *factory,
            None => {
                warn!(
                    algorithm = %name,
                    fallback = DEFAULT_ALGORITHM,
                    supported = ?self.names(),
                    "Unsupported rate limiting algorithm, using fallback"
                );
                build_token_bucket as AlgorithmFactory
            }
        };
        factory(store, params)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn build_token_bucket(store: Arc<dyn StateStore>, params: LimitParams) -> Arc<dyn RateLimitAlgorithm> {
    Arc::new(TokenBucketLimiter::new(store, params))
}

fn build_leaky_bucket(store: Arc<dyn StateStore>, params: LimitParams) -> Arc<dyn RateLimitAlgorithm> {
    Arc::new(LeakyBucketLimiter::new(store, params))
}

fn build_fixed_window(store: Arc<dyn StateStore>, params: LimitParams) -> Arc<dyn RateLimitAlgorithm> {
    Arc::new(FixedWindowLimiter::new(store, params))
}

fn build_sliding_window(store: Arc<dyn StateStore>, params: LimitParams) -> Arc<dyn RateLimitAlgorithm> {
    Arc::new(SlidingWindowLimiter::new(store, params))
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}
