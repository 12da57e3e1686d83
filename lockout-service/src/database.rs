//! PostgreSQL connection pool for the account store

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::connect::with_retries;
use crate::error::{sanitize_url, DatabaseError, Result};

/// Create a PostgreSQL connection pool, retrying with exponential backoff
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = with_retries(
        "Database",
        config.max_retries,
        Duration::from_secs(config.retry_delay_secs),
        || try_create_pool(config),
    )
    .await?;

    tracing::info!(
        url = %sanitize_url(&config.url),
        max_connections = config.max_connections,
        "Database connection pool created"
    );
    Ok(pool)
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            let kind = categorize_db_error(&e);
            DatabaseError::from(e).add_context(format!("{} at {}", kind, sanitize_url(&config.url)))
        })?;

    Ok(pool)
}

/// Short operator hint for a connection failure
fn categorize_db_error(err: &sqlx::Error) -> &'static str {
    use sqlx::Error;
    match err {
        Error::Configuration(_) => "configuration error",
        Error::Database(_) => "database rejected the connection",
        Error::Io(_) => "network I/O error",
        Error::Tls(_) => "TLS error",
        Error::PoolTimedOut => "pool timeout",
        Error::PoolClosed => "pool closed",
        _ => "connection error",
    }
}
