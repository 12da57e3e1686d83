//! In-process account store for tests and local development

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Account, AccountStore, ApplyOutcome, AuditRecord, EventMeta, LockStatus};
use crate::error::{DatabaseError, Error, Result};

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    audit: Vec<AuditRecord>,
}

/// Account store held in process memory
///
/// Account and audit tables sit behind one mutex so `apply_lockout` is
/// all-or-nothing like the database transaction it stands in for.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    tables: Mutex<Tables>,
    reads: AtomicU64,
    injected_failures: Mutex<VecDeque<DatabaseError>>,
    read_latency: Mutex<Option<Duration>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an account, replacing any existing row for the identity
    pub fn insert(&self, account: Account) {
        self.lock_tables()
            .accounts
            .insert(account.identity.clone(), account);
    }

    /// Number of `find_by_identity` calls served so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make the next `apply_lockout` calls fail with these errors, in order
    pub fn fail_next_applies(&self, errors: impl IntoIterator<Item = DatabaseError>) {
        if let Ok(mut queue) = self.injected_failures.lock() {
            queue.extend(errors);
        }
    }

    /// Delay every `find_by_identity`, simulating a slow database
    pub fn set_read_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.read_latency.lock() {
            *guard = latency;
        }
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned table only means a test panicked mid-write
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Account>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let latency = self.read_latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.lock_tables().accounts.get(identity).cloned())
    }

    async fn apply_lockout(
        &self,
        identity: &str,
        failed_count: u32,
        raw_payload: &str,
        meta: EventMeta,
    ) -> Result<ApplyOutcome> {
        let injected = self
            .injected_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(err) = injected {
            return Err(Error::Database(err));
        }

        let mut tables = self.lock_tables();
        let now = Utc::now();

        let outcome = match tables.accounts.get_mut(identity) {
            Some(account) => {
                account.lock_status = LockStatus::Locked;
                account.failed_count = failed_count;
                account.updated_at = now;
                ApplyOutcome::Locked
            }
            None => ApplyOutcome::MissingAccount,
        };

        let id = tables.audit.len() as i64 + 1;
        tables.audit.push(AuditRecord {
            id,
            identity: identity.to_string(),
            failed_count,
            raw_payload: raw_payload.to_string(),
            event_id: meta.event_id,
            stream_sequence: meta.stream_sequence,
            inserted_at: now,
        });

        Ok(outcome)
    }

    async fn audit_records(&self, identity: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .lock_tables()
            .audit
            .iter()
            .filter(|record| record.identity == identity)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_counts_reads() {
        let store = MemoryAccountStore::new();
        store.insert(Account::active("alice", "pw"));

        assert!(store.find_by_identity("alice").await.unwrap().is_some());
        assert!(store.find_by_identity("nobody").await.unwrap().is_none());
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn test_apply_lockout_is_idempotent_on_account() {
        let store = MemoryAccountStore::new();
        store.insert(Account::active("alice", "pw"));

        for _ in 0..2 {
            let outcome = store
                .apply_lockout("alice", 5, r#"{"failed_count":5}"#, EventMeta::default())
                .await
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::Locked);
        }

        let account = store.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(account.lock_status, LockStatus::Locked);
        assert_eq!(account.failed_count, 5);
        assert_eq!(store.audit_records("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_lockout_for_missing_account_still_audits() {
        let store = MemoryAccountStore::new();
        let outcome = store
            .apply_lockout("ghost", 7, "{}", EventMeta::default())
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::MissingAccount);
        assert!(store.find_by_identity("ghost").await.unwrap().is_none());
        assert_eq!(store.audit_records("ghost").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = MemoryAccountStore::new();
        store.insert(Account::active("alice", "pw"));
        store.fail_next_applies([DatabaseError::connection_failed("down")]);

        let err = store
            .apply_lockout("alice", 5, "{}", EventMeta::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let account = store.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(account.lock_status, LockStatus::Active);
        assert!(store.audit_records("alice").await.unwrap().is_empty());
    }
}
