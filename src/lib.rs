pub mod algorithms;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod response;
pub mod server;
pub mod store;
pub mod throttler;
pub mod whitelist;

pub use algorithms::{AlgorithmRegistry, Decision, DenyReason, LimitParams, QuotaSnapshot, RateLimitAlgorithm};
pub use config::{Config, FailurePolicy};
pub use error::{LimiterError, Result};
pub use identity::{ClientIdentityResolver, ClientKey};
pub use rate_limit_config::RateLimitSettings;
pub use response::Rejection;
pub use server::{build_state, create_app};
pub use store::StateStore;
pub use throttler::{Throttler, Verdict};
pub use whitelist::Whitelist;
