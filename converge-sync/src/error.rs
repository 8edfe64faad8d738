//! Error types for the sync layer.

use converge_types::ErrorKind;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in fetch and watch operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The coordination link is down.
    #[error("sync unavailable: {0}")]
    Unavailable(String),

    /// Nothing exists at or below the path.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The path is empty or malformed.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// The subscription fell behind the tree and missed events.
    #[error("watch lagged behind by {0} events")]
    Lagged(u64),

    /// The history needed to resume from `requested` has been discarded.
    #[error("revision {requested} has been compacted (history resumes after {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A background task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Returns the programmatic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Unavailable(_) | SyncError::Lagged(_) | SyncError::ChannelClosed => {
                ErrorKind::SyncUnavailable
            }
            SyncError::NotFound(_) | SyncError::Compacted { .. } => ErrorKind::NotFound,
            SyncError::InvalidPath(_) => ErrorKind::Argument,
            SyncError::Serialization(_) | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }
}
