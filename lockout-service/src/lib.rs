//! # lockout-service
//!
//! Login lockout coordination for horizontally scaled authentication
//! front-ends. Request handlers decide every attempt against a shared
//! attempt cache (Redis) and a durable account store (PostgreSQL); lockout
//! transitions travel over a partitioned event channel (NATS JetStream) to a
//! reconciler that persists them with an audit trail.
//!
//! ## Features
//!
//! - **Fast path**: a cached lock flag rejects attempts without touching the store
//! - **Atomic counters**: concurrent failures each observe a distinct count
//! - **Asynchronous persistence**: the request path never waits on durable writes
//! - **At-least-once reconciliation**: ordered per identity, dead letters for bad events
//! - **In-process backends**: every dependency has an in-memory twin for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use lockout_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::connect(config).await?;
//!     Server::new(state).serve().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod attempts;
pub mod cache;
pub mod channel;
pub mod config;
mod connect;
pub mod database;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod lockout;
pub mod observability;
pub mod reconciler;
pub mod server;
pub mod state;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::account::{
        Account, AccountStore, AccountView, ApplyOutcome, AuditRecord, EventMeta, LockStatus,
        MemoryAccountStore, PgAccountStore,
    };
    pub use crate::attempts::{AttemptCache, AttemptState, MemoryAttemptCache, RedisAttemptCache};
    pub use crate::channel::{
        DeadLetter, DeadLetterReason, DeadLetterSink, Delivery, EventPublisher, EventSource,
        JetStreamDeadLetters, JetStreamPublisher, JetStreamSource, LockoutEvent,
        MemoryDeadLetters, MemoryEventLog,
    };
    pub use crate::config::Config;
    pub use crate::error::{
        DatabaseError, DatabaseErrorKind, DatabaseOperation, Dependency, Error, Result,
    };
    pub use crate::handlers::router;
    pub use crate::lockout::{
        Argon2Verifier, AuthOutcome, CredentialScheme, CredentialVerifier, LockoutConfig,
        LockoutCoordinator, LockoutEmitter, PlaintextVerifier, StatusReport,
    };
    pub use crate::observability::init_tracing;
    pub use crate::reconciler::{ReconcileOutcome, Reconciler, ReconcilerConfig, StatsSnapshot};
    pub use crate::server::{shutdown_signal, Server};
    pub use crate::state::{AppState, AppStateBuilder};

    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
