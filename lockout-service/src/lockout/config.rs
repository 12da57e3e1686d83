//! Login lockout configuration
//!
//! Configures the lockout threshold, attempt cache keys and the deadlines the
//! coordinator applies to every dependency call on the request path.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Login lockout configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [lockout]
/// max_attempts = 5
/// key_prefix = "login"
/// # state_ttl_secs = 1800
/// cache_timeout_ms = 250
/// store_timeout_ms = 2000
/// emit_queue_capacity = 1024
/// credential_scheme = "argon2"
/// ```
///
/// Attempt state has no expiry unless `state_ttl_secs` is set: a locked
/// identity stays locked until a successful authentication clears it or an
/// operator intervenes. With a TTL, both the counter and the lock flag age
/// out that many seconds after the most recent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LockoutConfig {
    /// Consecutive failed attempts at which the account is locked
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Redis key prefix for attempt keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Optional cool-down after which attempt state expires (None = never)
    #[serde(default)]
    pub state_ttl_secs: Option<u64>,

    /// Deadline for a single attempt cache call in milliseconds
    #[serde(default = "default_cache_timeout_ms")]
    pub cache_timeout_ms: u64,

    /// Deadline for an account store read in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Lockout events buffered for publishing before new ones are dropped
    #[serde(default = "default_emit_queue_capacity")]
    pub emit_queue_capacity: usize,

    /// How stored credential references are compared
    #[serde(default)]
    pub credential_scheme: CredentialScheme,
}

/// Format of `Account::credential_ref`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScheme {
    /// Argon2 PHC strings
    #[default]
    Argon2,
    /// The reference is the credential itself
    Plaintext,
}

impl LockoutConfig {
    /// Validate the configuration, returning an error message if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.key_prefix.is_empty() {
            return Err("key_prefix must not be empty".to_string());
        }
        if self.key_prefix.contains(':') {
            return Err("key_prefix must not contain ':'".to_string());
        }
        if self.key_prefix.contains(char::is_whitespace) {
            return Err("key_prefix must not contain whitespace".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.state_ttl_secs == Some(0) {
            return Err("state_ttl_secs must be greater than 0 when set".to_string());
        }
        if self.cache_timeout_ms == 0 || self.store_timeout_ms == 0 {
            return Err("dependency timeouts must be greater than 0".to_string());
        }
        if self.emit_queue_capacity == 0 {
            return Err("emit_queue_capacity must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Builder-style threshold override
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder-style cool-down override
    pub fn with_state_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.state_ttl_secs = ttl_secs;
        self
    }

    /// Builder-style deadline override for cache and store calls
    pub fn with_timeouts(mut self, cache_timeout_ms: u64, store_timeout_ms: u64) -> Self {
        self.cache_timeout_ms = cache_timeout_ms;
        self.store_timeout_ms = store_timeout_ms;
        self
    }

    /// Builder-style emit queue capacity override
    pub fn with_emit_queue_capacity(mut self, capacity: usize) -> Self {
        self.emit_queue_capacity = capacity;
        self
    }

    /// Builder-style credential scheme override
    pub fn with_credential_scheme(mut self, scheme: CredentialScheme) -> Self {
        self.credential_scheme = scheme;
        self
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            key_prefix: default_key_prefix(),
            state_ttl_secs: None,
            cache_timeout_ms: default_cache_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            emit_queue_capacity: default_emit_queue_capacity(),
            credential_scheme: CredentialScheme::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_key_prefix() -> String {
    "login".to_string()
}

fn default_cache_timeout_ms() -> u64 {
    250
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_emit_queue_capacity() -> usize {
    1024
}
