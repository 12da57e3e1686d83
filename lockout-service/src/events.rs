//! NATS client and JetStream context for the event channel

use async_nats::jetstream;
use async_nats::Client;
use std::time::Duration;

use crate::config::NatsConfig;
use crate::connect::with_retries;
use crate::error::{Error, Result};

/// Connect to NATS, retrying with exponential backoff
pub async fn create_client(config: &NatsConfig) -> Result<Client> {
    let client = with_retries(
        "NATS",
        config.max_retries,
        Duration::from_secs(config.retry_delay_secs),
        || try_create_client(config),
    )
    .await?;

    tracing::info!("NATS client connected to {}", config.url);
    Ok(client)
}

/// JetStream context over an established client
pub fn jetstream_context(client: Client) -> jetstream::Context {
    jetstream::new(client)
}

async fn try_create_client(config: &NatsConfig) -> Result<Client> {
    let mut opts = async_nats::ConnectOptions::new().max_reconnects(Some(config.max_reconnects));

    if let Some(name) = &config.name {
        opts = opts.name(name);
    }

    opts.connect(&config.url).await.map_err(|e| {
        Error::Nats(format!(
            "Failed to connect to NATS server at '{}' (max reconnects {}, client name {}): {}",
            config.url,
            config.max_reconnects,
            config.name.as_deref().unwrap_or("<none>"),
            e
        ))
    })
}
