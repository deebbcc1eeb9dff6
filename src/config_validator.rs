use crate::config::Config;
use crate::error::LimiterError;
use regex::Regex;
use std::sync::LazyLock;

static REDIS_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^rediss?://([^@/\s]*@)?[A-Za-z0-9._\-\[\]:]+(/\d+)?$")
        .expect("redis url pattern compiles")
});

pub const MIN_ADMIN_TOKEN_LEN: usize = 16;

/// Validates the transport half of the configuration. Failures here are
/// fatal at startup; the rate limit section never is.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), LimiterError> {
        if url.is_empty() {
            return Err(LimiterError::Validation(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(LimiterError::Validation(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        if !REDIS_URL_PATTERN.is_match(url) {
            return Err(LimiterError::Validation(format!(
                "Redis URL '{}' is not of the form redis://[user:password@]host[:port][/db]",
                url
            )));
        }

        Ok(())
    }

    pub fn validate_store_timeout(timeout_ms: u64) -> Result<(), LimiterError> {
        if timeout_ms == 0 {
            return Err(LimiterError::Validation(
                "Store timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_max_attempts(attempts: u32) -> Result<(), LimiterError> {
        if attempts == 0 {
            return Err(LimiterError::Validation(
                "Compare-and-set attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_key_prefix(prefix: &str) -> Result<(), LimiterError> {
        if prefix.trim().is_empty() || prefix.contains(char::is_whitespace) {
            return Err(LimiterError::Validation(
                "Key prefix must be non-empty and contain no whitespace".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_admin_token(token: &str) -> Result<(), LimiterError> {
        if token.len() < MIN_ADMIN_TOKEN_LEN || token.contains(char::is_whitespace) {
            return Err(LimiterError::Validation(format!(
                "Admin token must be at least {} characters with no whitespace",
                MIN_ADMIN_TOKEN_LEN
            )));
        }

        Ok(())
    }

    /// Validates server configuration parameters
    pub fn validate_server_config(config: &Config) -> Result<(), LimiterError> {
        if config.bind_addr.port() == 0 {
            return Err(LimiterError::Validation(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if config.uses_redis() {
            Self::validate_redis_url(config.redis_url.trim())?;
        }
        Self::validate_store_timeout(config.store_timeout_ms)?;
        Self::validate_max_attempts(config.max_attempts)?;
        Self::validate_key_prefix(&config.key_prefix)?;
        if let Some(token) = &config.admin_token {
            Self::validate_admin_token(token)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("redis://:secret@cache.internal:6380/2").is_ok());
        assert!(ConfigValidator::validate_redis_url("redis://127.0.0.1").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
        assert!(ConfigValidator::validate_redis_url("redis://").is_err());
        assert!(ConfigValidator::validate_redis_url("redis://local host:6379").is_err());
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(ConfigValidator::validate_store_timeout(0).is_err());
        assert!(ConfigValidator::validate_store_timeout(50).is_ok());
        assert!(ConfigValidator::validate_max_attempts(0).is_err());
        assert!(ConfigValidator::validate_max_attempts(3).is_ok());
    }

    #[test]
    fn test_invalid_key_prefix() {
        assert!(ConfigValidator::validate_key_prefix("").is_err());
        assert!(ConfigValidator::validate_key_prefix("rate limit").is_err());
        assert!(ConfigValidator::validate_key_prefix("rate_limit").is_ok());
    }

    #[test]
    fn test_admin_token() {
        assert!(ConfigValidator::validate_admin_token("").is_err());
        assert!(ConfigValidator::validate_admin_token("short").is_err());
        assert!(ConfigValidator::validate_admin_token("has a space in it").is_err());
        assert!(ConfigValidator::validate_admin_token("0123456789abcdef").is_ok());

        let config = Config::try_parse_from(["gatekeeper", "--admin-token", "x"]).unwrap();
        assert!(ConfigValidator::validate_server_config(&config).is_err());
    }

    #[test]
    fn test_valid_server_config() {
        let config = Config::try_parse_from(["gatekeeper"]).unwrap();
        assert!(ConfigValidator::validate_server_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_server_config() {
        let config = Config::try_parse_from([
            "gatekeeper",
            "--redis-url",
            "invalid://localhost:6379",
        ])
        .unwrap();
        assert!(ConfigValidator::validate_server_config(&config).is_err());

        let config = Config::try_parse_from(["gatekeeper", "--bind-addr", "127.0.0.1:0"]).unwrap();
        assert!(ConfigValidator::validate_server_config(&config).is_err());
    }
}
