//! `lockout migrate`

use anyhow::{Context, Result};
use colored::Colorize;
use lockout_service::account::PgAccountStore;
use lockout_service::channel::jetstream::ensure_streams;
use lockout_service::config::Config;
use lockout_service::{database, events};

pub async fn execute(config: Config) -> Result<()> {
    let pool = database::create_pool(&config.database)
        .await
        .context("Failed to connect to the account store")?;
    PgAccountStore::new(pool)
        .migrate()
        .await
        .context("Failed to create the account schema")?;
    println!("{} accounts, lockout_audit", "Schema ready:".green().bold());

    let client = events::create_client(&config.nats)
        .await
        .context("Failed to connect to the event channel")?;
    ensure_streams(&events::jetstream_context(client), &config.nats)
        .await
        .context("Failed to create the event streams")?;
    println!(
        "{} {}, {}",
        "Streams ready:".green().bold(),
        config.nats.stream,
        config.nats.dead_letter_stream
    );

    Ok(())
}
