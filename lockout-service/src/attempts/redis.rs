//! Redis-backed attempt cache
//!
//! Follows the key layout the login servers already use:
//! `{prefix}:fail:{identity}` holds the counter and `{prefix}:lock:{identity}`
//! holds the lock flag.

use std::ops::DerefMut;

use async_trait::async_trait;
use deadpool_redis::Pool as RedisPool;
use tracing::debug;

use super::AttemptCache;
use crate::error::{Error, Result};
use crate::lockout::LockoutConfig;

/// Attempt cache stored in Redis
///
/// Construct once at startup and share through `Arc<dyn AttemptCache>`.
#[derive(Clone)]
pub struct RedisAttemptCache {
    redis_pool: RedisPool,
    key_prefix: String,
    ttl_secs: Option<u64>,
}

impl RedisAttemptCache {
    /// Create a cache using the lockout key prefix and optional cool-down
    pub fn new(config: &LockoutConfig, redis_pool: RedisPool) -> Self {
        Self {
            redis_pool,
            key_prefix: config.key_prefix.clone(),
            ttl_secs: config.state_ttl_secs,
        }
    }

    /// Get a Redis connection from the pool
    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.redis_pool.get().await.map_err(|e| {
            let redis_err = redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get Redis connection for attempt cache",
                e.to_string(),
            ));
            Error::Redis(Box::new(redis_err))
        })
    }

    /// Build the Redis key for the failure counter
    fn fail_key(&self, identity: &str) -> String {
        format!("{}:fail:{}", self.key_prefix, identity)
    }

    /// Build the Redis key for the lock flag
    fn lock_key(&self, identity: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, identity)
    }
}

#[async_trait]
impl AttemptCache for RedisAttemptCache {
    async fn increment(&self, identity: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let fail_key = self.fail_key(identity);

        let count: u64 = match self.ttl_secs {
            None => {
                redis::cmd("INCR")
                    .arg(&fail_key)
                    .query_async(conn.deref_mut())
                    .await?
            }
            // MULTI/EXEC keeps increment and expiry one indivisible call
            Some(ttl) => {
                let (count,): (u64,) = redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(&fail_key)
                    .cmd("EXPIRE")
                    .arg(&fail_key)
                    .arg(ttl as i64)
                    .ignore()
                    .query_async(conn.deref_mut())
                    .await?;
                count
            }
        };

        debug!(identity = identity, attempt_count = count, "Failure counter incremented");
        Ok(count)
    }

    async fn set_lock_flag(&self, identity: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.lock_key(identity)).arg("1");
        if let Some(ttl) = self.ttl_secs {
            cmd.arg("EX").arg(ttl as i64);
        }
        let _: () = cmd.query_async(conn.deref_mut()).await?;
        Ok(())
    }

    async fn clear_all(&self, identity: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.fail_key(identity))
            .arg(self.lock_key(identity))
            .query_async(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn has_lock_flag(&self, identity: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.lock_key(identity))
            .query_async(conn.deref_mut())
            .await?;
        Ok(exists)
    }

    async fn get_counter(&self, identity: &str) -> Result<Option<u64>> {
        let mut conn = self.get_connection().await?;
        let count: Option<u64> = redis::cmd("GET")
            .arg(self.fail_key(identity))
            .query_async(conn.deref_mut())
            .await?;
        Ok(count)
    }
}
