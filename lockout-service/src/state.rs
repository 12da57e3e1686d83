//! Application state management

use std::sync::Arc;

use crate::account::{AccountStore, PgAccountStore};
use crate::attempts::{AttemptCache, RedisAttemptCache};
use crate::channel::{EventPublisher, JetStreamPublisher};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lockout::{
    Argon2Verifier, CredentialScheme, CredentialVerifier, LockoutCoordinator, LockoutEmitter,
    PlaintextVerifier,
};
use crate::{cache, database, events};

/// Application state shared across handlers
///
/// Cloning is cheap; the coordinator and config sit behind `Arc`s.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    coordinator: Arc<LockoutCoordinator>,
}

impl AppState {
    /// Wrap an already constructed coordinator
    pub fn new(config: Config, coordinator: LockoutCoordinator) -> Self {
        Self {
            config: Arc::new(config),
            coordinator: Arc::new(coordinator),
        }
    }

    /// Create a new builder for AppState
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// Connect to Redis, PostgreSQL and NATS and build the production state
    pub async fn connect(config: Config) -> Result<Self> {
        let redis_pool = cache::create_pool(&config.redis).await?;
        let pg_pool = database::create_pool(&config.database).await?;
        let nats = events::create_client(&config.nats).await?;

        let attempts = RedisAttemptCache::new(&config.lockout, redis_pool);
        let accounts = PgAccountStore::new(pg_pool);
        let publisher = JetStreamPublisher::new(events::jetstream_context(nats), &config.nats);

        Self::builder()
            .config(config)
            .attempts(Arc::new(attempts))
            .accounts(Arc::new(accounts))
            .publisher(Arc::new(publisher))
            .build()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the lockout coordinator
    pub fn coordinator(&self) -> &Arc<LockoutCoordinator> {
        &self.coordinator
    }
}

/// Builder for [`AppState`]
///
/// Every backend is passed in explicitly. The verifier defaults to the one
/// selected by `lockout.credential_scheme`.
#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<Config>,
    attempts: Option<Arc<dyn AttemptCache>>,
    accounts: Option<Arc<dyn AccountStore>>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn attempts(mut self, attempts: Arc<dyn AttemptCache>) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn accounts(mut self, accounts: Arc<dyn AccountStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Build the state and start the lockout emitter
    ///
    /// Must be called inside a Tokio runtime. The emitter's drain task
    /// lives until the last coordinator handle is dropped.
    pub fn build(self) -> Result<AppState> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let attempts = self.attempts.ok_or_else(|| missing("attempt cache"))?;
        let accounts = self.accounts.ok_or_else(|| missing("account store"))?;
        let publisher = self.publisher.ok_or_else(|| missing("event publisher"))?;
        let verifier = self
            .verifier
            .unwrap_or_else(|| verifier_for(config.lockout.credential_scheme));

        let (emitter, _drain) = LockoutEmitter::spawn(publisher, config.lockout.emit_queue_capacity);
        let coordinator =
            LockoutCoordinator::new(config.lockout.clone(), attempts, accounts, verifier, emitter);

        tracing::debug!(
            max_attempts = config.lockout.max_attempts,
            state_ttl_secs = ?config.lockout.state_ttl_secs,
            "Application state built"
        );
        Ok(AppState::new(config, coordinator))
    }
}

/// Verifier matching a credential scheme
pub fn verifier_for(scheme: CredentialScheme) -> Arc<dyn CredentialVerifier> {
    match scheme {
        CredentialScheme::Argon2 => Arc::new(Argon2Verifier),
        CredentialScheme::Plaintext => Arc::new(PlaintextVerifier),
    }
}

fn missing(what: &str) -> Error {
    Error::Internal(format!("AppState builder is missing the {}", what))
}
