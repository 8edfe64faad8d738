//! Error types for the transaction layer.

use converge_types::{ErrorKind, TypesError};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for transaction operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in transaction operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed call, rejected before touching the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No resource matched.
    #[error("resource not found in {schema_id}: {detail}")]
    NotFound { schema_id: String, detail: String },

    /// Unique identifier or integrity constraint violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A lock required by the isolation level / lock policy is held by
    /// another transaction.
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// The transaction was committed or closed.
    #[error("transaction is closed")]
    TransactionClosed,

    /// `set_isolation_level` after the transaction already ran an operation.
    #[error("isolation level cannot change after the transaction has been used")]
    IsolationLocked,

    /// A filter that must select one resource selected several.
    #[error("filter matched {matched} resources in {schema_id}, expected one")]
    AmbiguousFilter { schema_id: String, matched: usize },

    /// The backend does not implement this operation or query form.
    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid schema or resource.
    #[error(transparent)]
    Types(#[from] TypesError),

    /// Store bookkeeping failed (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub(crate) fn not_found(schema_id: &str, detail: impl Into<String>) -> Self {
        Self::NotFound {
            schema_id: schema_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Returns the programmatic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::InvalidArgument(_)
            | DbError::IsolationLocked
            | DbError::AmbiguousFilter { .. }
            | DbError::Unsupported(_) => ErrorKind::Argument,
            DbError::NotFound { .. } => ErrorKind::NotFound,
            DbError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            DbError::LockConflict(_) => ErrorKind::LockConflict,
            DbError::TransactionClosed => ErrorKind::TransactionClosed,
            DbError::Types(e) => e.kind(),
            DbError::Database(_) | DbError::Serialization(_) | DbError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                DbError::LockConflict(e.to_string())
            }
            Some(ErrorCode::ConstraintViolation) => DbError::ConstraintViolation(e.to_string()),
            _ => DbError::Database(e),
        }
    }
}
