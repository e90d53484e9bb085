//! Unified error handling for the ruta proxy
//!
//! Every failure the proxy can hit (configuration, registry administration,
//! probing, pooling, routing and statement execution) is expressed as a
//! variant of [`RutaError`]. Probe failures never leave the health monitor;
//! pool and routing failures travel up to the session handler, which decides
//! whether the client may retry.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::core::PoolId;

/// Main error type for ruta operations
#[derive(Debug, Error)]
pub enum RutaError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire protocol errors on the client side
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Backend {id} is already registered")]
    DuplicateBackend { id: String },

    #[error("Pool {id} already exists")]
    DuplicatePool { id: PoolId },

    #[error("Routing rule {id} already exists")]
    DuplicateRule { id: u32 },

    #[error("Unknown backend: {id}")]
    UnknownBackend { id: String },

    #[error("Unknown pool: {id}")]
    UnknownPool { id: PoolId },

    #[error("Unknown routing rule: {id}")]
    UnknownRule { id: u32 },

    /// A probe could not reach the backend
    #[error("Backend {backend_id} unreachable: {reason}")]
    Unreachable { backend_id: String, reason: String },

    /// All connection slots for a backend are busy, or growing the pool failed
    #[error("Connection pool for {backend_id} exhausted: {reason}")]
    PoolExhausted { backend_id: String, reason: String },

    /// The backend is OFFLINE and may not lend connections
    #[error("Backend {backend_id} is unavailable")]
    BackendUnavailable { backend_id: String },

    /// No ONLINE backend can serve the pool (fatal to the request only)
    #[error("No backend available for pool {pool_id}")]
    NoBackendAvailable { pool_id: PoolId },

    /// A statement could not stay on the backend its transaction started on
    #[error("Transaction affinity violated: {message}")]
    AffinityViolation { message: String },

    /// Transport-level failure on an established backend connection
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// SQL error reported by the database server itself
    #[error("Query error {code} ({sql_state}): {message}")]
    Query {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("Connection pools are closed")]
    PoolClosed,

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for ruta operations
pub type RutaResult<T> = Result<T, RutaError>;

/// Convenience methods for creating specific error types
impl RutaError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        RutaError::Backend {
            message: message.into(),
        }
    }

    pub fn unreachable<S: Into<String>, R: Into<String>>(backend_id: S, reason: R) -> Self {
        RutaError::Unreachable {
            backend_id: backend_id.into(),
            reason: reason.into(),
        }
    }

    pub fn pool_exhausted<S: Into<String>, R: Into<String>>(backend_id: S, reason: R) -> Self {
        RutaError::PoolExhausted {
            backend_id: backend_id.into(),
            reason: reason.into(),
        }
    }

    pub fn backend_unavailable<S: Into<String>>(backend_id: S) -> Self {
        RutaError::BackendUnavailable {
            backend_id: backend_id.into(),
        }
    }

    pub fn unknown_backend<S: Into<String>>(id: S) -> Self {
        RutaError::UnknownBackend { id: id.into() }
    }

    pub fn affinity<S: Into<String>>(message: S) -> Self {
        RutaError::AffinityViolation {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RutaError::Protocol(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        RutaError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        RutaError::Internal {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        RutaError::Config(ConfigError::ValidationError(message.into()))
    }

    /// Check if this error is recoverable (the same work may succeed elsewhere)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RutaError::Network(_)
                | RutaError::Backend { .. }
                | RutaError::Unreachable { .. }
                | RutaError::PoolExhausted { .. }
                | RutaError::BackendUnavailable { .. }
                | RutaError::Timeout { .. }
        )
    }

    /// Whether the backend connection this error occurred on must be discarded.
    ///
    /// A SQL error leaves the connection usable; anything else does not.
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, RutaError::Query { .. })
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RutaError::Config(_) => ErrorSeverity::Critical,
            RutaError::Internal { .. } => ErrorSeverity::Critical,
            RutaError::Network(_) => ErrorSeverity::Warning,
            RutaError::Backend { .. } => ErrorSeverity::Warning,
            RutaError::PoolExhausted { .. } => ErrorSeverity::Warning,
            RutaError::Timeout { .. } => ErrorSeverity::Warning,
            RutaError::Unreachable { .. } => ErrorSeverity::Info,
            RutaError::Query { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
