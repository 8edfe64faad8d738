//! Transactional resource store for converge.
//!
//! A [`Transaction`] is a single-owner unit of work over resources and their
//! reconciliation state. Each transaction is bound at creation to an
//! [`IsolationLevel`] and a [`LockPolicy`]; both are explicit per-call
//! configuration because the consistency of multi-resource operations depends
//! on the caller picking the right strength.
//!
//! # Backends
//!
//! - [`MemoryStore`]: shared in-memory tables with row locks, used by tests
//!   and embedded callers
//! - [`SqliteStore`]: one SQLite file, one connection per transaction
//!
//! Both implement [`TransactionStore`], the factory collaborators use to open
//! transactions.
//!
//! # Example
//!
//! ```
//! use converge_db::{MemoryStore, Transaction, TransactionStore};
//! use converge_types::{id_filter, LockPolicy, Resource, Schema};
//! use serde_json::Map;
//!
//! let store = MemoryStore::new();
//! let schema = Schema::new("network");
//!
//! let mut tx = store.begin_for(&schema, "create", LockPolicy::LockRelatedResources).unwrap();
//! tx.create(&Resource::new("network", "net-1", Map::new())).unwrap();
//! tx.commit().unwrap();
//! tx.close().unwrap();
//!
//! let mut tx = store.begin_for(&schema, "read", LockPolicy::SkipRelatedResources).unwrap();
//! let state = tx.state_fetch(&schema, &id_filter("net-1")).unwrap();
//! assert_eq!(state.config_version, 1);
//! ```

mod error;
mod isolation;
mod locks;
mod memory;
mod sqlite;
mod transaction;

pub use converge_types::{IsolationLevel, LockPolicy};
pub use error::{DbError, DbResult};
pub use isolation::{resolve_for, resolve_isolation, READ_ACTION};
pub use memory::{MemoryStore, MemoryTransaction};
pub use sqlite::{SqliteStore, SqliteTransaction};
pub use transaction::{IsolationRebind, Transaction, TransactionStore, TxId, TxStatus};
