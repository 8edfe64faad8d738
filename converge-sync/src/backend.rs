//! Coordination-store abstraction.
//!
//! A backend owns the connection to the coordination tree. The bridge only
//! reads through it: this crate never writes the tree.

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::node::SyncNode;
use crate::signal::{EventSink, StopListener};

/// Read access to a coordination tree.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Returns the node at `path` with all of its descendants.
    ///
    /// Each node carries its own revision. The subtree is not guaranteed to
    /// be one consistent snapshot.
    async fn fetch(&self, path: &str) -> SyncResult<SyncNode>;

    /// Streams mutations under `path` with a revision greater than
    /// `revision` into `sink`, in non-decreasing revision order.
    ///
    /// Returns `Ok(())` once `stop` is raised or the sink's receiver is
    /// dropped. Returns the first subscription failure as `Err`; nothing is
    /// delivered after it.
    async fn watch(
        &self,
        path: &str,
        revision: i64,
        sink: EventSink,
        stop: StopListener,
    ) -> SyncResult<()>;
}
