//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Account store errors
// ============================================================================

/// Account store operation in flight when an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseOperation {
    Connect,
    Query,
    Insert,
    Update,
    /// Begin or commit
    Transaction,
    Migration,
    PoolAcquire,
}

impl DatabaseOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Transaction => "transaction",
            Self::Migration => "migration",
            Self::PoolAcquire => "pool_acquire",
        }
    }
}

impl fmt::Display for DatabaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category; decides whether the reconciler retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseErrorKind {
    /// Server unreachable or connection dropped
    ConnectionFailed,
    /// No free connection within the acquire timeout
    PoolExhausted,
    /// Serialization failure or deadlock; the transaction may be rerun
    TransactionFailed,
    /// Check, unique or foreign key constraint rejected the write
    ConstraintViolation,
    /// A column value could not be mapped to the domain type
    TypeConversion,
    /// Bad connection URL or options
    Configuration,
    QueryFailed,
}

impl DatabaseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::PoolExhausted => "pool_exhausted",
            Self::TransactionFailed => "transaction_failed",
            Self::ConstraintViolation => "constraint_violation",
            Self::TypeConversion => "type_conversion",
            Self::Configuration => "configuration",
            Self::QueryFailed => "query_failed",
        }
    }
}

impl fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured database error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    /// The operation being performed when the error occurred
    pub operation: DatabaseOperation,
    /// The category of error
    pub kind: DatabaseErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional context (e.g., table name, identity)
    pub context: Option<String>,
}

impl DatabaseError {
    /// Create a new database error
    pub fn new(
        operation: DatabaseOperation,
        kind: DatabaseErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Connect,
            DatabaseErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Query,
            DatabaseErrorKind::QueryFailed,
            message,
        )
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::PoolAcquire,
            DatabaseErrorKind::PoolExhausted,
            message,
        )
    }

    /// Create a transaction failed error
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Transaction,
            DatabaseErrorKind::TransactionFailed,
            message,
        )
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionFailed
                | DatabaseErrorKind::PoolExhausted
                | DatabaseErrorKind::TransactionFailed
        )
    }

    /// Attach the operation that was in flight
    pub fn during(mut self, operation: DatabaseOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Add context to an existing error
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Database {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let Some(ref ctx) = self.context {
            write!(f, " [context: {}]", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for DatabaseError {}

/// Sanitize a connection URL by removing credentials
pub fn sanitize_url(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end + 3];
            let after_at = &url[at_pos + 1..];
            return format!("{}<redacted>@{}", scheme, after_at);
        }
    }
    url.to_string()
}

// ============================================================================
// Service error
// ============================================================================

/// External dependency that a request-path call was waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// The ephemeral attempt cache
    AttemptCache,
    /// The durable account store
    AccountStore,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptCache => write!(f, "attempt_cache"),
            Self::AccountStore => write!(f, "account_store"),
        }
    }
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the lockout service
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration values that load but make no sense
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Structured database error with operation context
    #[error("{0}")]
    Database(DatabaseError),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// NATS error
    #[error("NATS error: {0}")]
    Nats(String),

    /// A dependency call exceeded its deadline
    #[error("{dependency} did not answer within {after_ms}ms")]
    Timeout {
        /// Which dependency timed out
        dependency: Dependency,
        /// The deadline that was exceeded
        after_ms: u64,
    },

    /// An event payload could not be decoded
    #[error("Malformed lockout event: {0}")]
    MalformedEvent(String),

    /// The stored credential reference could not be used for verification
    #[error("Credential error: {0}")]
    Credential(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry of the same operation may succeed
    ///
    /// Covers unreachable or slow dependencies. Malformed input, bad
    /// configuration and credential errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => e.is_retriable(),
            Error::Redis(_) | Error::Nats(_) | Error::Timeout { .. } | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Short machine-readable code used in HTTP bodies and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Redis(_) => "CACHE_ERROR",
            Error::Nats(_) => "EVENT_CHANNEL_ERROR",
            Error::Timeout { .. } => "DEPENDENCY_TIMEOUT",
            Error::MalformedEvent(_) => "MALFORMED_EVENT",
            Error::Credential(_) => "CREDENTIAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match self {
            Error::Database(ref e) => {
                tracing::error!(
                    operation = %e.operation,
                    kind = %e.kind,
                    context = ?e.context,
                    retriable = e.is_retriable(),
                    "Database error: {}", e.message
                );
                (StatusCode::INTERNAL_SERVER_ERROR, "Database operation failed")
            }
            Error::Timeout { dependency, after_ms } => {
                tracing::error!(%dependency, after_ms, "Dependency timed out");
                (StatusCode::GATEWAY_TIMEOUT, "Dependency timed out")
            }
            ref other => {
                tracing::error!(code, "Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(ErrorResponse::with_code(status, code, message))).into_response()
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        Error::Database(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DatabaseError::from(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedEvent(err.to_string())
    }
}

/// SQLSTATEs for serialization failure and deadlock
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::PoolTimedOut => Self::pool_exhausted("Connection pool timed out"),
            E::PoolClosed => Self::connection_failed("Connection pool is closed"),
            E::WorkerCrashed => Self::connection_failed("Database worker crashed"),
            E::Io(e) => Self::connection_failed(e.to_string()),
            E::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            E::Configuration(e) => Self::new(
                DatabaseOperation::Connect,
                DatabaseErrorKind::Configuration,
                e.to_string(),
            ),
            E::ColumnDecode { index, source } => Self::new(
                DatabaseOperation::Query,
                DatabaseErrorKind::TypeConversion,
                format!("Failed to decode column {}: {}", index, source),
            ),
            E::Decode(e) => Self::new(
                DatabaseOperation::Query,
                DatabaseErrorKind::TypeConversion,
                e.to_string(),
            ),
            E::Database(db_err) => {
                let retryable = db_err
                    .code()
                    .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code.as_ref()));
                let kind = if retryable {
                    DatabaseErrorKind::TransactionFailed
                } else if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    DatabaseErrorKind::ConstraintViolation
                } else {
                    DatabaseErrorKind::QueryFailed
                };
                Self::new(DatabaseOperation::Query, kind, db_err.message().to_string())
            }
            other => Self::query_failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_kinds() {
        assert!(DatabaseError::connection_failed("down").is_retriable());
        assert!(DatabaseError::pool_exhausted("busy").is_retriable());
        assert!(DatabaseError::transaction_failed("serialization").is_retriable());
        assert!(!DatabaseError::query_failed("syntax").is_retriable());
    }

    #[test]
    fn test_transient_classification() {
        let timeout = Error::Timeout {
            dependency: Dependency::AccountStore,
            after_ms: 2000,
        };
        assert!(timeout.is_transient());
        assert!(Error::Nats("no responders".into()).is_transient());
        assert!(Error::Database(DatabaseError::connection_failed("refused")).is_transient());

        assert!(!Error::MalformedEvent("missing failed_count".into()).is_transient());
        assert!(!Error::Database(DatabaseError::query_failed("bad sql")).is_transient());
        assert!(!Error::Credential("bad hash".into()).is_transient());
    }

    #[test]
    fn test_timeout_display_names_dependency() {
        let err = Error::Timeout {
            dependency: Dependency::AttemptCache,
            after_ms: 250,
        };
        assert_eq!(err.to_string(), "attempt_cache did not answer within 250ms");
    }

    #[test]
    fn test_database_error_display_with_context() {
        let err = DatabaseError::query_failed("relation missing").add_context("accounts");
        let display = err.to_string();
        assert!(display.contains("query_failed"));
        assert!(display.contains("query"));
        assert!(display.contains("[context: accounts]"));
    }

    #[test]
    fn test_sanitize_url_hides_password() {
        assert_eq!(
            sanitize_url("postgres://lockout:secret@db:5432/lockout"),
            "postgres://<redacted>@db:5432/lockout"
        );
        assert_eq!(sanitize_url("redis://localhost:6379"), "redis://localhost:6379");
    }

    #[test]
    fn test_status_codes() {
        let response = Error::Timeout {
            dependency: Dependency::AccountStore,
            after_ms: 10,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = Error::Internal("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
