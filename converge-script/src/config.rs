//! Environment configuration, read from a TOML file.
//!
//! ```toml
//! [database]
//! backend = "sqlite"
//! path = "/var/lib/converge/resources.db"
//! default_lock_policy = "lock_related_resources"
//! isolation_rebind = "reject_after_use"
//!
//! [sync]
//! event_buffer = 32
//! grace_period_ms = 1000
//! ```
//!
//! Every key is optional.

use converge_db::{IsolationRebind, MemoryStore, SqliteStore, TransactionStore};
use converge_sync::{SyncBackend, SyncBridge, DEFAULT_EVENT_BUFFER, DEFAULT_GRACE_PERIOD};
use converge_types::LockPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: BackendKind,
    /// Database file. Required for `sqlite`.
    pub path: Option<PathBuf>,
    pub default_lock_policy: LockPolicy,
    pub isolation_rebind: IsolationRebind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Per-watch event buffer. Events arriving while it is full are dropped.
    pub event_buffer: usize,
    /// How long a stopped subscription may take to finish before it is
    /// aborted.
    pub grace_period_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            grace_period_ms: u64::try_from(DEFAULT_GRACE_PERIOD.as_millis()).unwrap_or(1000),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

impl EnvironmentConfig {
    /// Loads the environment file at `path`.
    ///
    /// A missing file yields the defaults. A file that exists but cannot be
    /// read or parsed is an error.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No environment file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!("Loaded environment from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.sync.event_buffer == 0 {
            return Err(ConfigError::Invalid("sync.event_buffer must be at least 1".into()));
        }
        Ok(config)
    }

    /// Opens the configured transaction store.
    pub fn open_store(&self) -> ConfigResult<Arc<dyn TransactionStore>> {
        let db = &self.database;
        match db.backend {
            BackendKind::Memory => Ok(Arc::new(
                MemoryStore::new().with_isolation_rebind(db.isolation_rebind),
            )),
            BackendKind::Sqlite => {
                let path = db.path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("database.path is required for the sqlite backend".into())
                })?;
                Ok(Arc::new(
                    SqliteStore::open(path)?.with_isolation_rebind(db.isolation_rebind),
                ))
            }
        }
    }

    /// A bridge over `backend` with the configured buffer and grace period.
    pub fn sync_bridge(&self, backend: Arc<dyn SyncBackend>) -> SyncBridge {
        SyncBridge::new(backend)
            .with_event_buffer(self.sync.event_buffer)
            .with_grace_period(Duration::from_millis(self.sync.grace_period_ms))
    }
}
