//! Error taxonomy shared by every converge crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for type-level operations (schema registration, resource
/// construction).
pub type TypesResult<T> = Result<T, TypesError>;

/// The programmatic kind of a failure.
///
/// Every error enum in the workspace maps onto exactly one kind so that
/// callers (CLI, scripting bridge) can translate failures without matching on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad arity or argument type, detected before any I/O.
    Argument,
    /// The addressed resource, schema or key does not exist.
    NotFound,
    /// A uniqueness or integrity constraint was violated.
    ConstraintViolation,
    /// A required lock could not be acquired under the active isolation
    /// level and lock policy. The caller decides whether to retry.
    LockConflict,
    /// The transaction was already released.
    TransactionClosed,
    /// The coordination link is down.
    SyncUnavailable,
    /// A watch was terminated by its stop signal.
    WatchCancelled,
    /// Anything else: backend failures, serialization, configuration.
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name, suitable for script-visible error objects.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Argument => "argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::LockConflict => "lock_conflict",
            ErrorKind::TransactionClosed => "transaction_closed",
            ErrorKind::SyncUnavailable => "sync_unavailable",
            ErrorKind::WatchCancelled => "watch_cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while building schemas and resources.
#[derive(Debug, Error)]
pub enum TypesError {
    /// A schema with the same id is already registered.
    #[error("schema already registered: {0}")]
    DuplicateSchema(String),

    /// No schema with this id is registered.
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    /// The resource body is not usable (not an object, missing id, ...).
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// The string does not name an isolation level.
    #[error("unknown isolation level: {0}")]
    UnknownIsolationLevel(String),
}

impl TypesError {
    /// Returns the programmatic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TypesError::DuplicateSchema(_) => ErrorKind::ConstraintViolation,
            TypesError::UnknownSchema(_) => ErrorKind::NotFound,
            TypesError::InvalidResource(_) | TypesError::UnknownIsolationLevel(_) => {
                ErrorKind::Argument
            }
        }
    }
}
