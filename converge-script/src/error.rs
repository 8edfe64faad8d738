//! Error types for the script bindings and environment loading.

use converge_db::DbError;
use converge_sync::SyncError;
use converge_types::ErrorKind;
use thiserror::Error;

/// Result type for script builtins.
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Result type for environment configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors thrown back into the script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Wrong arity or argument type. Raised before any I/O.
    #[error("{function}: {message}")]
    Argument { function: String, message: String },

    /// No builtin with this name.
    #[error("unknown builtin: {0}")]
    UnknownFunction(String),

    /// The sync call itself failed.
    #[error("{context}: {source}")]
    Sync {
        context: &'static str,
        #[source]
        source: SyncError,
    },
}

impl ScriptError {
    pub(crate) fn argument(function: &str, message: impl Into<String>) -> Self {
        Self::Argument {
            function: function.to_string(),
            message: message.into(),
        }
    }

    /// Returns the programmatic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScriptError::Argument { .. } | ScriptError::UnknownFunction(_) => ErrorKind::Argument,
            ScriptError::Sync { source, .. } => source.kind(),
        }
    }
}

/// Errors loading the environment file or opening what it describes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but describes something unusable.
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to open store: {0}")]
    Store(#[from] DbError),
}

impl ConfigError {
    /// Returns the programmatic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Invalid(_) => ErrorKind::Argument,
            ConfigError::Store(e) => e.kind(),
            ConfigError::Io(_) | ConfigError::Parse(_) => ErrorKind::Internal,
        }
    }
}
