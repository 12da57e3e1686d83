//! `lockout serve`

use anyhow::{Context, Result};
use lockout_service::config::Config;
use lockout_service::server::Server;
use lockout_service::state::AppState;

pub async fn execute(config: Config) -> Result<()> {
    let state = AppState::connect(config)
        .await
        .context("Failed to connect to the attempt cache, account store or event channel")?;

    Server::new(state).serve().await?;
    Ok(())
}
