//! In-memory coordination tree.
//!
//! Keys are `/`-separated paths. Every write bumps one tree-wide revision
//! counter and is kept in a bounded history log, so a watch can start from any
//! revision still in the log. Older revisions are compacted away; a watch
//! starting before the log fails with `Compacted`.
//!
//! The write side (`put`, `delete`, `fail_link`) stands in for the external
//! agents that own the tree in a real deployment.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::SyncBackend;
use crate::error::{SyncError, SyncResult};
use crate::node::{is_under, normalize_path, SyncAction, SyncEvent, SyncNode};
use crate::signal::{Delivery, EventSink, StopListener};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
enum TreeMessage {
    Event(SyncEvent),
    LinkLost(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    revision: i64,
}

#[derive(Debug, Default)]
struct TreeState {
    entries: BTreeMap<String, Entry>,
    revision: i64,
    history: VecDeque<SyncEvent>,
    /// Newest revision dropped from `history`.
    compacted: i64,
    link_down: Option<String>,
}

/// A coordination tree held in process memory. Cloning shares the tree.
#[derive(Debug, Clone)]
pub struct MemorySyncTree {
    state: Arc<Mutex<TreeState>>,
    events: broadcast::Sender<TreeMessage>,
    history_limit: usize,
}

impl Default for MemorySyncTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySyncTree {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// `capacity` bounds how far a watcher may fall behind live writes
    /// before it fails with `Lagged`.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(TreeState::default())),
            events,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Number of past events kept for watches that start behind the tree.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, TreeState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Internal("sync tree mutex poisoned".into()))
    }

    fn record(&self, state: &mut TreeState, action: SyncAction, key: &str, raw: Option<&str>) -> i64 {
        state.revision += 1;
        let event = SyncEvent::from_raw(action, key, raw, state.revision);
        state.history.push_back(event.clone());
        while state.history.len() > self.history_limit {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.revision;
            }
        }
        // No receivers is fine.
        let _ = self.events.send(TreeMessage::Event(event));
        state.revision
    }

    /// Writes `value` at `key`, returning the new revision.
    pub fn put(&self, key: &str, value: impl Into<String>) -> SyncResult<i64> {
        let key = normalize_path(key)?;
        if key == "/" {
            return Err(SyncError::InvalidPath(key));
        }
        let value = value.into();
        let mut state = self.lock()?;
        let action = if state.entries.contains_key(&key) {
            SyncAction::Updated
        } else {
            SyncAction::Created
        };
        let revision = self.record(&mut state, action, &key, Some(&value));
        state.entries.insert(key, Entry { value, revision });
        Ok(revision)
    }

    /// Removes `key`, returning the revision of the deletion.
    pub fn delete(&self, key: &str) -> SyncResult<i64> {
        let key = normalize_path(key)?;
        let mut state = self.lock()?;
        if state.entries.remove(&key).is_none() {
            return Err(SyncError::NotFound(key));
        }
        Ok(self.record(&mut state, SyncAction::Deleted, &key, None))
    }

    /// Simulates losing the coordination link. Running watches fail with
    /// `Unavailable`; new fetches and watches fail until [`restore_link`].
    ///
    /// [`restore_link`]: Self::restore_link
    pub fn fail_link(&self, reason: impl Into<String>) -> SyncResult<()> {
        let reason = reason.into();
        let mut state = self.lock()?;
        state.link_down = Some(reason.clone());
        let _ = self.events.send(TreeMessage::LinkLost(reason));
        Ok(())
    }

    pub fn restore_link(&self) -> SyncResult<()> {
        self.lock()?.link_down = None;
        Ok(())
    }

    /// The latest revision issued.
    pub fn revision(&self) -> SyncResult<i64> {
        Ok(self.lock()?.revision)
    }

    /// Newest revision no longer replayable. A watch must start at or after
    /// it.
    pub fn compacted_revision(&self) -> SyncResult<i64> {
        Ok(self.lock()?.compacted)
    }

    /// Number of live watch subscriptions.
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }
}

fn build_node(entries: &BTreeMap<String, Entry>, key: &str) -> Option<SyncNode> {
    let own = entries.get(key);
    let prefix = if key == "/" {
        "/".to_string()
    } else {
        format!("{key}/")
    };

    let mut child_keys = BTreeSet::new();
    for descendant in entries
        .range(prefix.clone()..)
        .map(|(k, _)| k)
        .take_while(|k| k.starts_with(&prefix))
    {
        let rest = &descendant[prefix.len()..];
        let first = rest.split('/').next().unwrap_or(rest);
        child_keys.insert(format!("{prefix}{first}"));
    }

    if own.is_none() && child_keys.is_empty() && key != "/" {
        return None;
    }

    Some(SyncNode {
        key: key.to_string(),
        value: own.map(|e| e.value.clone()).unwrap_or_default(),
        revision: own.map_or(0, |e| e.revision),
        children: child_keys
            .iter()
            .filter_map(|child| build_node(entries, child))
            .collect(),
    })
}

#[async_trait]
impl SyncBackend for MemorySyncTree {
    async fn fetch(&self, path: &str) -> SyncResult<SyncNode> {
        let path = normalize_path(path)?;
        let state = self.lock()?;
        if let Some(reason) = &state.link_down {
            return Err(SyncError::Unavailable(reason.clone()));
        }
        build_node(&state.entries, &path).ok_or(SyncError::NotFound(path))
    }

    async fn watch(
        &self,
        path: &str,
        revision: i64,
        sink: EventSink,
        mut stop: StopListener,
    ) -> SyncResult<()> {
        let path = normalize_path(path)?;

        // Subscribing under the lock means no write falls between the
        // replayed history and the live stream.
        let (backlog, mut rx) = {
            let state = self.lock()?;
            if let Some(reason) = &state.link_down {
                return Err(SyncError::Unavailable(reason.clone()));
            }
            if revision < state.compacted {
                return Err(SyncError::Compacted {
                    requested: revision,
                    compacted: state.compacted,
                });
            }
            let rx = self.events.subscribe();
            let backlog: Vec<SyncEvent> = state
                .history
                .iter()
                .filter(|e| e.revision > revision && is_under(&e.key, &path))
                .cloned()
                .collect();
            (backlog, rx)
        };
        debug!(path = %path, revision, replayed = backlog.len(), "watch started");

        for event in backlog {
            if sink.offer(event) == Delivery::Closed {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    debug!(path = %path, "watch stopped");
                    return Ok(());
                }
                _ = sink.closed() => return Ok(()),
                message = rx.recv() => match message {
                    Ok(TreeMessage::Event(event)) => {
                        if event.revision <= revision || !is_under(&event.key, &path) {
                            continue;
                        }
                        if sink.offer(event) == Delivery::Closed {
                            return Ok(());
                        }
                    }
                    Ok(TreeMessage::LinkLost(reason)) => {
                        return Err(SyncError::Unavailable(reason));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Err(SyncError::Lagged(missed));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SyncError::ChannelClosed);
                    }
                },
            }
        }
    }
}
