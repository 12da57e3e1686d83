//! `lockout status <identity>`

use anyhow::{Context, Result};
use lockout_service::account::{AccountStore, AccountView, PgAccountStore};
use lockout_service::attempts::{AttemptCache, RedisAttemptCache};
use lockout_service::config::Config;
use lockout_service::lockout::StatusReport;
use lockout_service::{cache, database};

/// Reads both stores directly; no coordinator or event channel is needed
pub async fn execute(config: Config, identity: &str) -> Result<()> {
    let redis = cache::create_pool(&config.redis)
        .await
        .context("Failed to connect to the attempt cache")?;
    let pool = database::create_pool(&config.database)
        .await
        .context("Failed to connect to the account store")?;

    let attempts = RedisAttemptCache::new(&config.lockout, redis);
    let accounts = PgAccountStore::new(pool);

    let (account, ephemeral) = tokio::try_join!(
        accounts.find_by_identity(identity),
        attempts.snapshot(identity),
    )?;

    let report = StatusReport {
        identity: identity.to_string(),
        durable: account.as_ref().map(AccountView::from),
        ephemeral,
    };
    print!("{}", report);
    Ok(())
}
