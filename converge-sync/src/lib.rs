//! Coordination-tree client for converge.
//!
//! Configuration written through `converge-db` is mirrored by other agents
//! into a shared coordination tree. This crate reads that tree:
//!
//! - [`SyncBackend`]: the seam to a concrete coordination store, with
//!   [`MemorySyncTree`] as the in-process implementation
//! - [`SyncBridge`]: cancellable fetch, and a watch that returns the next
//!   event, a timeout or a cancellation as one call
//! - [`EventSink`], [`StopSignal`], [`CancelSignal`]: the bounded mailboxes
//!   connecting a caller to its background subscription
//!
//! # Example
//!
//! ```
//! use converge_sync::{CancelSignal, MemorySyncTree, SyncBridge, WatchOutcome};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let tree = MemorySyncTree::new();
//! tree.put("/config/network/n1", r#"{"name":"alpha"}"#).unwrap();
//!
//! let bridge = SyncBridge::new(Arc::new(tree.clone()));
//! let mut cancel = CancelSignal::never();
//! let outcome = bridge
//!     .watch("/config", 0, Duration::from_secs(1), &mut cancel)
//!     .await
//!     .unwrap();
//! let event = outcome.into_event().unwrap();
//! assert_eq!(event.revision, 1);
//! assert_eq!(event.data["name"], "alpha");
//! # });
//! ```

mod backend;
mod bridge;
mod error;
mod memory;
mod node;
mod signal;

pub use backend::SyncBackend;
pub use bridge::{SyncBridge, WatchOutcome, DEFAULT_GRACE_PERIOD};
pub use error::{SyncError, SyncResult};
pub use memory::MemorySyncTree;
pub use node::{is_under, normalize_path, SyncAction, SyncEvent, SyncNode};
pub use signal::{
    cancel_pair, event_channel, stop_channel, CancelHandle, CancelSignal, Delivery, EventSink,
    StopListener, StopSignal, DEFAULT_EVENT_BUFFER,
};
