use crate::algorithms::{Decision, DenyReason, QuotaSnapshot, RateLimitAlgorithm};
use crate::clock::{Clock, SystemClock};
use crate::config::FailurePolicy;
use crate::error::{LimiterError, Result};
use crate::identity::{ClientIdentityResolver, ClientKey};
use crate::metrics::MetricsCollector;
use crate::response::Rejection;
use crate::store::StateStore;
use crate::whitelist::Whitelist;
use axum::http::HeaderMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a client is told to wait when the store is unavailable and the
/// policy is fail-closed.
const STORE_UNAVAILABLE_RETRY: Duration = Duration::from_secs(1);

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Whitelisted: no state touched, no headers added.
    Exempt,
    Admit(QuotaSnapshot),
    /// The store failed and the fail-open policy admitted the request.
    FailOpen,
    Deny(Rejection),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Verdict::Deny(_))
    }
}

/// Per-request admission control: whitelist gate, identity, algorithm, and
/// the failure policy applied when the state store cannot answer.
pub struct Throttler {
    resolver: ClientIdentityResolver,
    whitelist: Whitelist,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    expose_headers: bool,
    metrics: MetricsCollector,
}

impl Throttler {
    pub fn new(algorithm: Arc<dyn RateLimitAlgorithm>, store: Arc<dyn StateStore>) -> Self {
        Self {
            resolver: ClientIdentityResolver::new(),
            whitelist: Whitelist::default(),
            algorithm,
            store,
            clock: Arc::new(SystemClock),
            failure_policy: FailurePolicy::Open,
            store_timeout: Duration::from_millis(50),
            expose_headers: true,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_expose_headers(mut self, expose: bool) -> Self {
        self.expose_headers = expose;
        self
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn expose_headers(&self) -> bool {
        self.expose_headers
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Admission check for a request. Never fails: store problems are
    /// resolved by the failure policy.
    pub async fn check(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Verdict {
        let client_key = self.resolver.resolve(headers, peer);
        self.check_client(&client_key).await
    }

    pub async fn check_client(&self, client_key: &ClientKey) -> Verdict {
        if self.whitelist.is_exempt(client_key.as_str()) {
            debug!(client_key = %client_key, "Whitelisted client, skipping rate limit");
            self.metrics.record_exempt();
            return Verdict::Exempt;
        }

        let now = self.clock.now_millis();
        let outcome = match tokio::time::timeout(
            self.store_timeout,
            self.algorithm.check(client_key.as_str(), now),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LimiterError::Timeout(self.store_timeout)),
        };

        match outcome {
            Ok(Decision::Admitted(quota)) => {
                debug!(
                    client_key = %client_key,
                    algorithm = self.algorithm.name(),
                    remaining = quota.remaining,
                    "Request admitted"
                );
                self.metrics.record_admitted();
                Verdict::Admit(quota)
            }
            Ok(Decision::Denied {
                reason,
                retry_after,
                quota,
            }) => {
                debug!(
                    client_key = %client_key,
                    algorithm = self.algorithm.name(),
                    reason = %reason,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request rate limited"
                );
                self.metrics.record_throttled();
                Verdict::Deny(Rejection::new(client_key.as_str(), reason, retry_after, &quota))
            }
            Err(err) => self.apply_failure_policy(client_key, err, now),
        }
    }

    fn apply_failure_policy(&self, client_key: &ClientKey, err: LimiterError, now: u64) -> Verdict {
        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    client_key = %client_key,
                    algorithm = self.algorithm.name(),
                    error = %err,
                    store_failure = err.is_store_failure(),
                    "Rate limit check failed, admitting request"
                );
                self.metrics.record_fail_open();
                Verdict::FailOpen
            }
            FailurePolicy::Closed => {
                warn!(
                    client_key = %client_key,
                    algorithm = self.algorithm.name(),
                    error = %err,
                    store_failure = err.is_store_failure(),
                    "Rate limit check failed, denying request"
                );
                self.metrics.record_fail_closed();
                let quota = QuotaSnapshot {
                    limit: self.algorithm.limit(),
                    remaining: 0,
                    reset_at_millis: now + STORE_UNAVAILABLE_RETRY.as_millis() as u64,
                };
                Verdict::Deny(Rejection::new(
                    client_key.as_str(),
                    DenyReason::StoreUnavailable,
                    STORE_UNAVAILABLE_RETRY,
                    &quota,
                ))
            }
        }
    }

    /// Forget all rate limit state held for `client_key`.
    pub async fn reset(&self, client_key: &str) -> Result<()> {
        if client_key.trim().is_empty() {
            return Err(LimiterError::Validation("client key must not be empty".to_string()));
        }
        let now = self.clock.now_millis();
        tokio::time::timeout(self.store_timeout, self.algorithm.reset(client_key, now))
            .await
            .map_err(|_| LimiterError::Timeout(self.store_timeout))??;
        debug!(client_key = %client_key, algorithm = self.algorithm.name(), "Rate limit state reset");
        Ok(())
    }
}
