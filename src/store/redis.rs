//! Redis-backed state store shared by every gateway instance.
//!
//! Compare-and-set and increment-with-expiry are Lua scripts so each runs as a
//! single atomic step on the server.

use super::StateStore;
use crate::error::{LimiterError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const INCREMENT_WITH_TTL: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and not string.match(current, '^-?%d+$') then
    return redis.error_reply('MALFORMED counter is not an integer')
end
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

/// Error code the increment script replies with for a non-integer counter.
const MALFORMED: &str = "MALFORMED";

/// Upper bound on key expiry, well inside what `PX` accepts.
const MAX_TTL_MILLIS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    compare_and_set: Script,
    increment_with_ttl: Script,
}

impl RedisStore {
    /// Create a store for `redis_url`. The connection is opened on first use,
    /// so an unreachable server surfaces as a store error per request rather
    /// than a startup failure.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| LimiterError::Store(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            compare_and_set: Script::new(COMPARE_AND_SET),
            increment_with_ttl: Script::new(INCREMENT_WITH_TTL),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = self.client.get_connection_manager().await.map_err(|e| {
                    LimiterError::Store(format!("Failed to connect to Redis: {}", e))
                })?;
                info!("Connected to Redis");
                Ok::<_, LimiterError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u128::from(MAX_TTL_MILLIS)) as u64
}

fn increment_error(key: &str, err: redis::RedisError) -> LimiterError {
    if err.code() == Some(MALFORMED) {
        LimiterError::MalformedState { key: key.to_string() }
    } else {
        LimiterError::Store(format!("increment failed: {}", err))
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(format!("GET failed: {}", e)))?;
        Ok(value)
    }

    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(format!("SET NX failed: {}", e)))?;
        Ok(reply.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        let swapped: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected)
            .arg(new_value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(format!("compare-and-set failed: {}", e)))?;
        if swapped == 0 {
            debug!(key = %key, "compare-and-set lost to a concurrent writer");
        }
        Ok(swapped == 1)
    }

    async fn atomic_increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection().await?;
        self.increment_with_ttl
            .key(key)
            .arg(delta)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| increment_error(key, e))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(format!("DEL failed: {}", e)))?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(format!("Ping failed: {}", e)))?;
        Ok(())
    }
}
