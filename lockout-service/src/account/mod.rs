//! Durable account store
//!
//! Accounts are provisioned out-of-band and never deleted here. The
//! coordinator only reads them; lock state is written exclusively by the
//! reconciler through [`AccountStore::apply_lockout`], which pairs the
//! account update with an append-only audit row in one transaction.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod pg;

pub use self::memory::MemoryAccountStore;
pub use self::pg::PgAccountStore;

/// Lock status of a durable account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Active,
    Locked,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Locked => "LOCKED",
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "LOCKED" => Ok(Self::Locked),
            other => Err(format!("unknown lock status '{}'", other)),
        }
    }
}

/// An account row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub identity: String,
    /// Stored credential reference compared by a [`CredentialVerifier`](crate::lockout::CredentialVerifier)
    pub credential_ref: String,
    pub lock_status: LockStatus,
    pub failed_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly provisioned, unlocked account
    pub fn active(identity: impl Into<String>, credential_ref: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            credential_ref: credential_ref.into(),
            lock_status: LockStatus::Active,
            failed_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_status == LockStatus::Locked
    }
}

/// Durable view of an account with the credential reference left out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    pub identity: String,
    pub lock_status: LockStatus,
    pub failed_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            identity: account.identity.clone(),
            lock_status: account.lock_status,
            failed_count: account.failed_count,
            updated_at: account.updated_at,
        }
    }
}

/// One row of the lockout audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub identity: String,
    pub failed_count: u32,
    pub raw_payload: String,
    pub event_id: Option<Uuid>,
    pub stream_sequence: Option<u64>,
    pub inserted_at: DateTime<Utc>,
}

/// Where an applied event came from, recorded alongside its audit row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMeta {
    pub event_id: Option<Uuid>,
    pub stream_sequence: Option<u64>,
}

/// What `apply_lockout` found when it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The account row now reads LOCKED with the event's snapshot
    Locked,
    /// No account row exists; only the audit row was written
    MissingAccount,
}

/// Authoritative account storage
#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    /// Look up an account by identity
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Account>>;

    /// Mark the account LOCKED with `failed_count` and append one audit row
    ///
    /// Both writes commit together or not at all. Replaying the same
    /// arguments leaves the account in the same state and appends another
    /// audit row.
    async fn apply_lockout(
        &self,
        identity: &str,
        failed_count: u32,
        raw_payload: &str,
        meta: EventMeta,
    ) -> Result<ApplyOutcome>;

    /// Audit trail for one identity, oldest first
    async fn audit_records(&self, identity: &str) -> Result<Vec<AuditRecord>>;
}
