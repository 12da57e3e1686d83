//! `lockout reconcile`

use std::sync::Arc;

use anyhow::{Context, Result};
use lockout_service::account::PgAccountStore;
use lockout_service::channel::jetstream::ensure_streams;
use lockout_service::channel::{JetStreamDeadLetters, JetStreamSource};
use lockout_service::config::Config;
use lockout_service::reconciler::Reconciler;
use lockout_service::server::shutdown_signal;
use lockout_service::{database, events};
use tokio_util::sync::CancellationToken;

pub async fn execute(config: Config) -> Result<()> {
    let pool = database::create_pool(&config.database)
        .await
        .context("Failed to connect to the account store")?;
    let client = events::create_client(&config.nats)
        .await
        .context("Failed to connect to the event channel")?;

    let context = events::jetstream_context(client);
    ensure_streams(&context, &config.nats).await?;

    let reconciler = Arc::new(Reconciler::new(
        config.reconciler.clone(),
        Arc::new(PgAccountStore::new(pool)),
        Arc::new(JetStreamDeadLetters::new(context.clone(), &config.nats)),
    ));
    let source = Arc::new(
        JetStreamSource::new(context, &config.nats)
            .with_max_ack_pending(config.reconciler.max_in_flight()),
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Stopping reconciler after in-flight events settle");
        trigger.cancel();
    });

    reconciler.run(source, shutdown).await?;
    Ok(())
}
