//! In-process attempt cache backed by `dashmap`
//!
//! Used by tests and single-process development setups. Each identity's
//! entry is mutated under the map's shard lock, which gives the same
//! per-identity linearizability Redis provides. The lock is never held
//! across an `.await`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::AttemptCache;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Entry {
    fail_count: Option<u64>,
    lock_flag: bool,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Attempt cache held in process memory
#[derive(Debug, Default)]
pub struct MemoryAttemptCache {
    entries: DashMap<String, Entry>,
    ttl: Option<Duration>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryAttemptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire attempt state `ttl` after the most recent failure
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Make every call fail as if the cache were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call, simulating a slow cache
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "attempt cache unavailable",
            )));
        }
        Ok(())
    }

    fn evict_expired(&self, identity: &str) {
        let now = Instant::now();
        self.entries.remove_if(identity, |_, entry| entry.expired(now));
    }
}

#[async_trait]
impl AttemptCache for MemoryAttemptCache {
    async fn increment(&self, identity: &str) -> Result<u64> {
        self.enter().await?;
        self.evict_expired(identity);

        let mut entry = self.entries.entry(identity.to_string()).or_default();
        let count = entry.fail_count.unwrap_or(0) + 1;
        entry.fail_count = Some(count);
        entry.expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        Ok(count)
    }

    async fn set_lock_flag(&self, identity: &str) -> Result<()> {
        self.enter().await?;
        self.evict_expired(identity);

        let mut entry = self.entries.entry(identity.to_string()).or_default();
        entry.lock_flag = true;
        if let Some(ttl) = self.ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn clear_all(&self, identity: &str) -> Result<()> {
        self.enter().await?;
        self.entries.remove(identity);
        Ok(())
    }

    async fn has_lock_flag(&self, identity: &str) -> Result<bool> {
        self.enter().await?;
        self.evict_expired(identity);
        Ok(self
            .entries
            .get(identity)
            .map(|entry| entry.lock_flag)
            .unwrap_or(false))
    }

    async fn get_counter(&self, identity: &str) -> Result<Option<u64>> {
        self.enter().await?;
        self.evict_expired(identity);
        Ok(self.entries.get(identity).and_then(|entry| entry.fail_count))
    }
}
