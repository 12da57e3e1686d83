//! Login lockout coordination
//!
//! Decides each authentication attempt against a shared attempt cache and
//! the durable account store, and hands lockout transitions to the event
//! channel without waiting on durable writes.
//!
//! # Architecture
//!
//! - [`LockoutCoordinator`]: per-request decision engine, constructed once
//! - [`LockoutEmitter`]: bounded FIFO between the request path and the channel
//! - [`CredentialVerifier`]: pluggable credential comparison
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lockout_service::lockout::{LockoutCoordinator, LockoutEmitter, PlaintextVerifier};
//!
//! let (emitter, _drain) = LockoutEmitter::spawn(publisher, config.emit_queue_capacity);
//! let coordinator = LockoutCoordinator::new(
//!     config,
//!     attempt_cache,
//!     account_store,
//!     Arc::new(PlaintextVerifier),
//!     emitter,
//! );
//!
//! match coordinator.authenticate("alice", "hunter2").await? {
//!     AuthOutcome::Success => { /* 200 */ }
//!     AuthOutcome::Invalid { attempt_count } => { /* 401 */ }
//!     AuthOutcome::Locked => { /* 423 */ }
//!     AuthOutcome::NotFound => { /* 404 */ }
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod credential;
pub mod emitter;

pub use config::{CredentialScheme, LockoutConfig};
pub use coordinator::{AuthOutcome, LockoutCoordinator, StatusReport};
pub use credential::{Argon2Verifier, CredentialVerifier, PlaintextVerifier};
pub use emitter::LockoutEmitter;
