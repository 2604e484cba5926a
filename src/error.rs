//! Error types for vmdeck.

use thiserror::Error;

/// Result type alias using vmdeck's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers that need to
/// react to the category rather than the message (e.g. HTTP status mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; nothing was changed.
    Validation,
    /// Valid input, but the entity is in the wrong state.
    Precondition,
    /// Duplicate entity or concurrent operation.
    Conflict,
    /// Entity does not exist.
    NotFound,
    /// Storage limits exceeded.
    Capacity,
    /// The hypervisor driver rejected or failed the call.
    Driver,
    /// Anything else (config, database, io).
    Internal,
}

/// Errors that can occur in vmdeck operations.
#[derive(Error, Debug)]
pub enum Error {
    // Orchestration errors
    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity is in the wrong state for the requested operation.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// VM is in an invalid lifecycle state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state(s).
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Duplicate entity or an operation already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Entity not found.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Entity kind ("vm", "snapshot", "pool", ...).
        kind: &'static str,
        /// Identifier that was looked up.
        name: String,
    },

    /// Storage pool capacity would be exceeded.
    #[error(
        "insufficient capacity in pool {pool}: requested {requested_b} bytes, {available_b} bytes available"
    )]
    Capacity {
        /// Pool name.
        pool: String,
        /// Requested bytes.
        requested_b: u64,
        /// Free bytes in the pool.
        available_b: u64,
    },

    /// Hypervisor driver call failed.
    #[error("driver {op} failed: {message}")]
    Driver {
        /// Driver operation name.
        op: String,
        /// Verbatim driver message.
        message: String,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with a message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a precondition error with a message.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a conflict error with a message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not-found error for an entity kind and identifier.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a driver error for an operation.
    pub fn driver(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Precondition(_) | Error::InvalidState { .. } => ErrorKind::Precondition,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Capacity { .. } => ErrorKind::Capacity,
            Error::Driver { .. } => ErrorKind::Driver,
            Error::Config(_) | Error::ConfigLoad(_) | Error::Database(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}
