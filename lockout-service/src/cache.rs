//! Redis connection pool for the attempt cache

use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::config::RedisConfig;
use crate::connect::with_retries;
use crate::error::{sanitize_url, Error, Result};

/// Create a Redis connection pool, retrying with exponential backoff
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let pool = with_retries(
        "Redis",
        config.max_retries,
        Duration::from_secs(config.retry_delay_secs),
        || try_create_pool(config),
    )
    .await?;

    tracing::info!(
        url = %sanitize_url(&config.url),
        max_connections = config.max_connections,
        "Redis connection pool created"
    );
    Ok(pool)
}

/// Build a pool and prove it can hand out a connection
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let timeout = Duration::from_secs(config.connection_timeout_secs);

    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| Error::Internal(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .create_timeout(Some(timeout))
        .wait_timeout(Some(timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create Redis pool: {}", e)))?;

    let conn = pool.get().await.map_err(|e| {
        Error::Redis(Box::new(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "Failed to get Redis connection",
            format!("{} ({})", e, sanitize_url(&config.url)),
        ))))
    })?;
    drop(conn);

    Ok(pool)
}
