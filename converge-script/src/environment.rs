use converge_db::TransactionStore;
use converge_sync::SyncBackend;
use converge_types::LockPolicy;
use std::sync::Arc;
use tracing::info;

use crate::bindings::SyncBindings;
use crate::config::EnvironmentConfig;
use crate::error::ConfigResult;

/// Everything a script host needs: the transaction store and the sync
/// builtins, both built from one [`EnvironmentConfig`].
#[derive(Clone)]
pub struct ScriptEnvironment {
    config: EnvironmentConfig,
    store: Arc<dyn TransactionStore>,
    bindings: SyncBindings,
}

impl ScriptEnvironment {
    pub fn from_config(config: EnvironmentConfig, backend: Arc<dyn SyncBackend>) -> ConfigResult<Self> {
        let store = config.open_store()?;
        let bindings = SyncBindings::new(config.sync_bridge(backend));
        info!(
            backend = ?config.database.backend,
            event_buffer = config.sync.event_buffer,
            "script environment ready"
        );
        Ok(Self {
            config,
            store,
            bindings,
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn bindings(&self) -> &SyncBindings {
        &self.bindings
    }

    /// Lock policy applied when a caller does not pick one.
    pub fn default_lock_policy(&self) -> LockPolicy {
        self.config.database.default_lock_policy
    }
}
