//! PostgreSQL account store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Account, AccountStore, ApplyOutcome, AuditRecord, EventMeta, LockStatus};
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, Result};

/// PostgreSQL-backed account store
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `accounts` and `lockout_audit` tables if they are missing
    ///
    /// Safe to run on every deploy.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                identity TEXT PRIMARY KEY,
                credential_ref TEXT NOT NULL,
                lock_status TEXT NOT NULL DEFAULT 'ACTIVE'
                    CHECK (lock_status IN ('ACTIVE', 'LOCKED')),
                failed_count INTEGER NOT NULL DEFAULT 0 CHECK (failed_count >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| migration_error(e, "accounts"))?;

        // No uniqueness on event_id: redelivered events append again
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lockout_audit (
                id BIGSERIAL PRIMARY KEY,
                identity TEXT NOT NULL,
                failed_count INTEGER NOT NULL,
                raw_payload TEXT NOT NULL,
                event_id UUID,
                stream_sequence BIGINT,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| migration_error(e, "lockout_audit"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_lockout_audit_identity ON lockout_audit (identity, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| migration_error(e, "idx_lockout_audit_identity"))?;

        Ok(())
    }
}

fn migration_error(err: sqlx::Error, object: &str) -> DatabaseError {
    DatabaseError::from(err)
        .during(DatabaseOperation::Migration)
        .add_context(object)
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT identity, credential_ref, lock_status, failed_count, updated_at \
             FROM accounts WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::from(e).add_context("accounts"))?;

        match row {
            Some(row) => Ok(Some(Account::try_from(row)?)),
            None => Ok(None),
        }
    }

    async fn apply_lockout(
        &self,
        identity: &str,
        failed_count: u32,
        raw_payload: &str,
        meta: EventMeta,
    ) -> Result<ApplyOutcome> {
        let failed_count = i32::try_from(failed_count).map_err(|_| {
            DatabaseError::new(
                DatabaseOperation::Update,
                DatabaseErrorKind::TypeConversion,
                format!("failed_count {} exceeds column range", failed_count),
            )
        })?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::from(e).during(DatabaseOperation::Transaction))?;

        let updated = sqlx::query(
            "UPDATE accounts SET lock_status = 'LOCKED', failed_count = $2, updated_at = now() \
             WHERE identity = $1",
        )
        .bind(identity)
        .bind(failed_count)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            DatabaseError::from(e)
                .during(DatabaseOperation::Update)
                .add_context("accounts")
        })?
        .rows_affected();

        sqlx::query(
            "INSERT INTO lockout_audit (identity, failed_count, raw_payload, event_id, stream_sequence) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(identity)
        .bind(failed_count)
        .bind(raw_payload)
        .bind(meta.event_id)
        .bind(meta.stream_sequence.and_then(|s| i64::try_from(s).ok()))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            DatabaseError::from(e)
                .during(DatabaseOperation::Insert)
                .add_context("lockout_audit")
        })?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::from(e).during(DatabaseOperation::Transaction))?;

        Ok(if updated == 0 {
            ApplyOutcome::MissingAccount
        } else {
            ApplyOutcome::Locked
        })
    }

    async fn audit_records(&self, identity: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, identity, failed_count, raw_payload, event_id, stream_sequence, inserted_at \
             FROM lockout_audit WHERE identity = $1 ORDER BY id ASC",
        )
        .bind(identity)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::from(e).add_context("lockout_audit"))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
struct AccountRow {
    identity: String,
    credential_ref: String,
    lock_status: String,
    failed_count: i32,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = DatabaseError;

    fn try_from(row: AccountRow) -> std::result::Result<Self, Self::Error> {
        let decode = |message: String| {
            DatabaseError::new(
                DatabaseOperation::Query,
                DatabaseErrorKind::TypeConversion,
                message,
            )
            .add_context(row.identity.clone())
        };

        let lock_status = row.lock_status.parse::<LockStatus>().map_err(&decode)?;
        let failed_count = u32::try_from(row.failed_count)
            .map_err(|_| decode(format!("negative failed_count {}", row.failed_count)))?;

        Ok(Account {
            identity: row.identity,
            credential_ref: row.credential_ref,
            lock_status,
            failed_count,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    identity: String,
    failed_count: i32,
    raw_payload: String,
    event_id: Option<Uuid>,
    stream_sequence: Option<i64>,
    inserted_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditRecord {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            identity: row.identity,
            failed_count: row.failed_count.max(0) as u32,
            raw_payload: row.raw_payload,
            event_id: row.event_id,
            stream_sequence: row.stream_sequence.map(|s| s.max(0) as u64),
            inserted_at: row.inserted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(lock_status: &str, failed_count: i32) -> AccountRow {
        AccountRow {
            identity: "alice".to_string(),
            credential_ref: "ref".to_string(),
            lock_status: lock_status.to_string(),
            failed_count,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_decodes_to_account() {
        let account = Account::try_from(row("LOCKED", 5)).unwrap();
        assert_eq!(account.lock_status, LockStatus::Locked);
        assert_eq!(account.failed_count, 5);
    }

    #[test]
    fn test_row_with_unknown_status_is_type_error() {
        let err = Account::try_from(row("FROZEN", 0)).unwrap_err();
        assert_eq!(err.kind, DatabaseErrorKind::TypeConversion);
        assert_eq!(err.context.as_deref(), Some("alice"));
    }

    #[test]
    fn test_row_with_negative_count_is_rejected() {
        assert!(Account::try_from(row("ACTIVE", -1)).is_err());
    }
}
