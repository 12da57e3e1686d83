//! Per-request lockout decisions
//!
//! The coordinator consults the attempt cache first and falls back to the
//! account store only when the cache has no lock flag. Its side effects are
//! confined to the attempt cache (synchronous) and the lockout emitter
//! (asynchronous). It never writes to the account store.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::LockoutConfig;
use super::credential::CredentialVerifier;
use super::emitter::LockoutEmitter;
use crate::account::{AccountStore, AccountView};
use crate::attempts::{AttemptCache, AttemptState};
use crate::channel::LockoutEvent;
use crate::error::{Dependency, Error, Result};

/// Result of an authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthOutcome {
    /// Credential matched; attempt state was reset
    Success,
    /// Credential did not match; `attempt_count` consecutive failures so far
    Invalid { attempt_count: u64 },
    /// The identity is locked
    Locked,
    /// No account exists for the identity
    NotFound,
}

impl AuthOutcome {
    /// Result code reported to callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Invalid { .. } => "invalid_credential",
            Self::Locked => "locked",
            Self::NotFound => "not_found",
        }
    }
}

/// Durable and ephemeral state of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub identity: String,
    /// `None` when no account exists
    pub durable: Option<AccountView>,
    pub ephemeral: AttemptState,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "identity={}", self.identity)?;
        match &self.durable {
            Some(view) => {
                writeln!(f, "durable.account=FOUND")?;
                writeln!(f, "durable.lock_status={}", view.lock_status)?;
                writeln!(f, "durable.failed_count={}", view.failed_count)?;
                writeln!(f, "durable.updated_at={}", view.updated_at.to_rfc3339())?;
            }
            None => writeln!(f, "durable.account=NOT_FOUND")?,
        }
        match self.ephemeral.fail_count {
            Some(count) => writeln!(f, "ephemeral.fail_count={}", count)?,
            None => writeln!(f, "ephemeral.fail_count=absent")?,
        }
        writeln!(f, "ephemeral.lock_flag={}", self.ephemeral.lock_flag)
    }
}

/// Lockout decision engine
///
/// Construct once at startup with explicitly created dependencies and share
/// it behind an `Arc`.
pub struct LockoutCoordinator {
    config: LockoutConfig,
    attempts: Arc<dyn AttemptCache>,
    accounts: Arc<dyn AccountStore>,
    verifier: Arc<dyn CredentialVerifier>,
    emitter: LockoutEmitter,
}

impl LockoutCoordinator {
    pub fn new(
        config: LockoutConfig,
        attempts: Arc<dyn AttemptCache>,
        accounts: Arc<dyn AccountStore>,
        verifier: Arc<dyn CredentialVerifier>,
        emitter: LockoutEmitter,
    ) -> Self {
        Self {
            config,
            attempts,
            accounts,
            verifier,
            emitter,
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    pub fn emitter(&self) -> &LockoutEmitter {
        &self.emitter
    }

    /// Decide one authentication attempt
    ///
    /// An `Err` means a dependency failed or timed out; callers report it as
    /// an internal error. No error leaves the attempt cache half-updated:
    /// every cache mutation is a single atomic call.
    pub async fn authenticate(&self, identity: &str, credential: &str) -> Result<AuthOutcome> {
        // Fast path: the cache flag alone decides
        if self.cached(self.attempts.has_lock_flag(identity)).await? {
            debug!(identity = identity, "Rejected on cached lock flag");
            return Ok(AuthOutcome::Locked);
        }

        let Some(account) = self.stored(self.accounts.find_by_identity(identity)).await? else {
            debug!(identity = identity, "Unknown identity");
            return Ok(AuthOutcome::NotFound);
        };

        if account.is_locked() {
            // Warm the cache so later attempts stay on the fast path
            if let Err(e) = self.cached(self.attempts.set_lock_flag(identity)).await {
                warn!(identity = identity, error = %e, "Failed to warm lock flag from account store");
            }
            return Ok(AuthOutcome::Locked);
        }

        if self.verifier.verify(credential, &account.credential_ref)? {
            if let Err(e) = self.cached(self.attempts.clear_all(identity)).await {
                warn!(identity = identity, error = %e, "Failed to clear attempt state after success");
            }
            return Ok(AuthOutcome::Success);
        }

        let attempt_count = self.cached(self.attempts.increment(identity)).await?;
        let max_attempts = u64::from(self.config.max_attempts);

        if attempt_count < max_attempts {
            debug!(
                identity = identity,
                attempt_count = attempt_count,
                max_attempts = max_attempts,
                "Login failure recorded"
            );
            return Ok(AuthOutcome::Invalid { attempt_count });
        }

        self.cached(self.attempts.set_lock_flag(identity)).await?;

        warn!(
            identity = identity,
            attempt_count = attempt_count,
            max_attempts = max_attempts,
            "Account locked due to repeated login failures"
        );

        let snapshot = u32::try_from(attempt_count).unwrap_or(u32::MAX);
        match LockoutEvent::new(identity, snapshot) {
            Ok(event) => self.emitter.emit(event),
            Err(e) => warn!(
                identity = identity,
                durability_gap = true,
                error = %e,
                "Failed to build lockout event"
            ),
        }

        Ok(AuthOutcome::Locked)
    }

    /// Combined durable and ephemeral view of an identity
    pub async fn status(&self, identity: &str) -> Result<StatusReport> {
        let (account, ephemeral) = tokio::try_join!(
            self.stored(self.accounts.find_by_identity(identity)),
            self.cached(self.attempts.snapshot(identity)),
        )?;

        info!(identity = identity, found = account.is_some(), "Status requested");

        Ok(StatusReport {
            identity: identity.to_string(),
            durable: account.as_ref().map(AccountView::from),
            ephemeral,
        })
    }

    async fn cached<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(Dependency::AttemptCache, self.config.cache_timeout(), call).await
    }

    async fn stored<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(Dependency::AccountStore, self.config.store_timeout(), call).await
    }
}

async fn bounded<T>(
    dependency: Dependency,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| Error::Timeout {
            dependency,
            after_ms: limit.as_millis() as u64,
        })?
}
