//! Attempt cache: ephemeral per-identity failure counters and lock flags
//!
//! The cache is shared by every coordinator instance, possibly across
//! processes, so cross-worker atomicity comes from the backend's own
//! primitives (`INCR` in Redis, entry locks in the in-memory map). Every
//! operation is a single call; none of them is a read-modify-write sequence
//! assembled by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryAttemptCache;
pub use self::redis::RedisAttemptCache;

/// Ephemeral attempt state for one identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptState {
    /// The identity the state belongs to
    pub identity: String,
    /// Consecutive failures since the last reset (`None` when absent)
    pub fail_count: Option<u64>,
    /// Whether the identity is locked on the fast path
    pub lock_flag: bool,
}

/// Shared ephemeral store of failure counters and lock flags
///
/// Operations are linearizable per identity. Operations on different
/// identities are independent and carry no ordering guarantee.
#[async_trait]
pub trait AttemptCache: Send + Sync + 'static {
    /// Atomically increment the failure counter, creating it at 1 if absent
    ///
    /// Returns the post-increment value.
    async fn increment(&self, identity: &str) -> Result<u64>;

    /// Set the lock flag; setting an already-set flag is a no-op
    async fn set_lock_flag(&self, identity: &str) -> Result<()>;

    /// Remove both the failure counter and the lock flag
    async fn clear_all(&self, identity: &str) -> Result<()>;

    /// Whether the lock flag is set
    async fn has_lock_flag(&self, identity: &str) -> Result<bool>;

    /// Current failure counter, `None` when absent
    async fn get_counter(&self, identity: &str) -> Result<Option<u64>>;

    /// Read counter and flag together for status reporting
    async fn snapshot(&self, identity: &str) -> Result<AttemptState> {
        let fail_count = self.get_counter(identity).await?;
        let lock_flag = self.has_lock_flag(identity).await?;
        Ok(AttemptState {
            identity: identity.to_string(),
            fail_count,
            lock_flag,
        })
    }
}
