use crate::algorithms::{
    AlgorithmRegistry, FixedWindowLimiter, LimitParams, SlidingWindowLimiter, DEFAULT_ALGORITHM,
};
use crate::error::{LimiterError, Result};
use crate::whitelist::Whitelist;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use validator::{Validate, ValidationError};

/// Longest accepted counting window.
pub const MAX_WINDOW_SIZE_SECONDS: u64 = 86_400;

/// Longest accepted per-client state expiry.
pub const MAX_STATE_TTL: Duration = Duration::from_secs(30 * 86_400);

/// Rate limiting section of the configuration.
///
/// Loaded once at startup. Invalid values are replaced by their defaults with
/// a warning instead of failing the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub algorithm: String,

    #[validate(custom(function = "validate_rate"))]
    pub requests_per_second: f64,

    #[validate(range(min = 1))]
    pub burst_capacity: u64,

    #[validate(range(min = 1, max = MAX_WINDOW_SIZE_SECONDS))]
    pub window_size_seconds: u64,

    pub whitelist_clients: Vec<String>,

    /// Expiry of per-client state, e.g. `"1h"`.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_state_ttl"))]
    pub state_ttl: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            algorithm: DEFAULT_ALGORITHM.to_string(),
            requests_per_second: 10.0,
            burst_capacity: 20,
            window_size_seconds: 60,
            whitelist_clients: Vec::new(),
            state_ttl: Duration::from_secs(3600),
        }
    }
}

fn validate_rate(rate: f64) -> std::result::Result<(), ValidationError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("non_positive_rate"))
    }
}

fn validate_state_ttl(ttl: &Duration) -> std::result::Result<(), ValidationError> {
    if ttl.is_zero() {
        Err(ValidationError::new("zero_duration"))
    } else if *ttl > MAX_STATE_TTL {
        Err(ValidationError::new("state_ttl_too_long"))
    } else {
        Ok(())
    }
}

impl RateLimitSettings {
    /// Load the section from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LimiterError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            LimiterError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// Replace every invalid field with its default, logging each fallback.
    /// Unknown algorithm names are normalised to the default here as well so
    /// the effective configuration reported at startup is accurate.
    pub fn sanitized(mut self, registry: &AlgorithmRegistry) -> Self {
        let defaults = Self::default();

        if let Err(errors) = self.validate() {
            for field in errors.field_errors().keys() {
                match &**field {
                    "requests_per_second" => {
                        warn!(
                            configured = self.requests_per_second,
                            fallback = defaults.requests_per_second,
                            "requestsPerSecond must be positive, using default"
                        );
                        self.requests_per_second = defaults.requests_per_second;
                    }
                    "burst_capacity" => {
                        warn!(
                            configured = self.burst_capacity,
                            fallback = defaults.burst_capacity,
                            "burstCapacity must be positive, using default"
                        );
                        self.burst_capacity = defaults.burst_capacity;
                    }
                    "window_size_seconds" => {
                        warn!(
                            configured = self.window_size_seconds,
                            fallback = defaults.window_size_seconds,
                            max = MAX_WINDOW_SIZE_SECONDS,
                            "windowSizeSeconds out of range, using default"
                        );
                        self.window_size_seconds = defaults.window_size_seconds;
                    }
                    "state_ttl" => {
                        warn!(
                            configured = ?self.state_ttl,
                            fallback = ?defaults.state_ttl,
                            max = ?MAX_STATE_TTL,
                            "stateTtl out of range, using default"
                        );
                        self.state_ttl = defaults.state_ttl;
                    }
                    other => warn!(field = %other, "Ignoring unexpected validation failure"),
                }
            }
        }

        if !registry.is_supported(&self.algorithm) {
            warn!(
                algorithm = %self.algorithm,
                fallback = DEFAULT_ALGORITHM,
                "Unsupported rate limiting algorithm, using fallback"
            );
            self.algorithm = defaults.algorithm;
        }

        let counts_windows = self.algorithm == FixedWindowLimiter::NAME
            || self.algorithm == SlidingWindowLimiter::NAME;
        if counts_windows && self.requests_per_second * (self.window_size_seconds as f64) < 1.0 {
            warn!(
                requests_per_second = self.requests_per_second,
                window_size_seconds = self.window_size_seconds,
                "Window allows less than one request, admitting one per window"
            );
        }

        self
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_seconds)
    }

    pub fn whitelist(&self) -> Whitelist {
        Whitelist::new(self.whitelist_clients.iter().cloned())
    }

    pub fn limit_params(&self, max_attempts: u32, key_prefix: &str) -> LimitParams {
        LimitParams {
            requests_per_second: self.requests_per_second,
            burst_capacity: self.burst_capacity,
            window_size: self.window_size(),
            state_ttl: self.state_ttl,
            max_attempts,
            key_prefix: key_prefix.to_string(),
        }
    }
}
