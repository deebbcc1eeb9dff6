use crate::algorithms::AlgorithmRegistry;
use crate::error::Result;
use crate::rate_limit_config::RateLimitSettings;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// What to do when the state store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// Process configuration. Every flag can also be set through the environment
/// (a `.env` file is honoured).
#[derive(Debug, Clone, Parser)]
#[command(name = "gatekeeper", version, about = "Distributed admission control for API gateways")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "GATEKEEPER_BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty keeps state in process (single instance only)
    #[arg(long, env = "GATEKEEPER_REDIS_URL", default_value = "")]
    pub redis_url: String,

    /// Log level for the gatekeeper target
    #[arg(long, env = "GATEKEEPER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Upper bound on a single admission check against the store
    #[arg(long, env = "GATEKEEPER_STORE_TIMEOUT_MS", default_value_t = 50)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "GATEKEEPER_FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::Open)]
    pub failure_policy: FailurePolicy,

    /// Compare-and-set attempts before a contended update counts as a store failure
    #[arg(long, env = "GATEKEEPER_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "GATEKEEPER_KEY_PREFIX", default_value = "rate_limit")]
    pub key_prefix: String,

    /// Attach X-RateLimit-* headers to admitted responses
    #[arg(long, env = "GATEKEEPER_EXPOSE_HEADERS", default_value_t = true, action = ArgAction::Set)]
    pub expose_headers: bool,

    /// Bearer token required on /admin routes; when unset they answer 401
    #[arg(long, env = "GATEKEEPER_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// JSON file with the rate limit section; overrides the flags below
    #[arg(long, env = "GATEKEEPER_SETTINGS")]
    pub settings: Option<PathBuf>,

    #[arg(long, env = "GATEKEEPER_ALGORITHM", default_value = "token-bucket")]
    pub algorithm: String,

    #[arg(long, env = "GATEKEEPER_REQUESTS_PER_SECOND", default_value_t = 10.0, allow_negative_numbers = true)]
    pub requests_per_second: f64,

    #[arg(long, env = "GATEKEEPER_BURST_CAPACITY", default_value_t = 20)]
    pub burst_capacity: u64,

    #[arg(long, env = "GATEKEEPER_WINDOW_SIZE_SECONDS", default_value_t = 60)]
    pub window_size_seconds: u64,

    /// Comma-separated client keys exempt from limiting, e.g. api_key:internal,ip:10.0.0.5
    #[arg(long, env = "GATEKEEPER_WHITELIST_CLIENTS", value_delimiter = ',')]
    pub whitelist_clients: Vec<String>,

    /// Expiry of idle client state, e.g. 1h or 30m
    #[arg(long, env = "GATEKEEPER_STATE_TTL", default_value = "1h", value_parser = humantime_serde::re::humantime::parse_duration)]
    pub state_ttl: Duration,
}

impl Config {
    /// Load configuration from the command line and environment.
    pub fn from_env() -> Self {
        Config::parse()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }

    /// The effective rate limit section: from the settings file when given,
    /// otherwise from flags, with invalid values replaced by defaults.
    pub fn rate_limit_settings(&self, registry: &AlgorithmRegistry) -> Result<RateLimitSettings> {
        let settings = match &self.settings {
            Some(path) => RateLimitSettings::from_file(path)?,
            None => RateLimitSettings {
                algorithm: self.algorithm.clone(),
                requests_per_second: self.requests_per_second,
                burst_capacity: self.burst_capacity,
                window_size_seconds: self.window_size_seconds,
                whitelist_clients: self.whitelist_clients.clone(),
                state_ttl: self.state_ttl,
            },
        };
        Ok(settings.sanitized(registry))
    }
}
