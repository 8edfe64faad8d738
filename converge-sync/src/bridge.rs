//! Turns background subscriptions into single cooperative calls.
//!
//! [`SyncBridge::watch`] starts a subscription in a background task and races
//! four outcomes, first one wins:
//!
//! 1. external cancellation
//! 2. the next event
//! 3. the timeout
//! 4. a subscription error
//!
//! Stop is raised before returning on every outcome but an error (the
//! subscription has already ended then). The call returns as soon as an
//! outcome is known; the background task is handed to a detached reaper that
//! gives it a bounded grace period to wind down before aborting it. One call
//! consumes at most one event; the remaining buffered events are discarded
//! with the subscription.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::SyncBackend;
use crate::error::{SyncError, SyncResult};
use crate::node::{SyncEvent, SyncNode};
use crate::signal::{event_channel, stop_channel, CancelSignal, DEFAULT_EVENT_BUFFER};

/// How long a stopped subscription may take to finish before it is aborted.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// How a [`SyncBridge::watch`] call ended, other than by error.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    Event(SyncEvent),
    TimedOut,
    Cancelled,
}

impl WatchOutcome {
    pub fn into_event(self) -> Option<SyncEvent> {
        match self {
            WatchOutcome::Event(event) => Some(event),
            WatchOutcome::TimedOut | WatchOutcome::Cancelled => None,
        }
    }
}

/// Cooperative fetch/watch over a [`SyncBackend`].
#[derive(Clone)]
pub struct SyncBridge {
    backend: Arc<dyn SyncBackend>,
    event_buffer: usize,
    grace_period: Duration,
}

impl SyncBridge {
    pub fn new(backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            backend,
            event_buffer: DEFAULT_EVENT_BUFFER,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Capacity of the per-call event buffer. Events offered while it is
    /// full are dropped.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    /// Fetches `path`, or returns `None` if cancelled first.
    pub async fn fetch(&self, path: &str, cancel: &mut CancelSignal) -> SyncResult<Option<SyncNode>> {
        let backend = Arc::clone(&self.backend);
        let owned = path.to_string();
        let mut task = tokio::spawn(async move { backend.fetch(&owned).await });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                debug!(path, "fetch cancelled");
                Ok(None)
            }
            joined = &mut task => match joined {
                Ok(result) => result.map(Some).inspect_err(|e| {
                    debug!(path, "fetch failed: {e}");
                }),
                Err(e) => Err(SyncError::Internal(format!("fetch task failed: {e}"))),
            },
        }
    }

    /// Waits for the first event under `path` newer than `revision`.
    pub async fn watch(
        &self,
        path: &str,
        revision: i64,
        timeout: Duration,
        cancel: &mut CancelSignal,
    ) -> SyncResult<WatchOutcome> {
        let (sink, mut events) = event_channel(self.event_buffer);
        let (stop, listener) = stop_channel();
        let (error_tx, mut error_rx) = oneshot::channel::<SyncError>();

        let backend = Arc::clone(&self.backend);
        let owned = path.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = backend.watch(&owned, revision, sink, listener).await {
                let _ = error_tx.send(e);
            }
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut events_open = true;
        let mut errors_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(WatchOutcome::Cancelled),
                event = events.recv(), if events_open => match event {
                    Some(event) if event.revision <= revision => {
                        debug!(path, revision = event.revision, "skipping stale event");
                    }
                    Some(event) => break Ok(WatchOutcome::Event(event)),
                    None => events_open = false,
                },
                _ = &mut deadline => break Ok(WatchOutcome::TimedOut),
                failed = &mut error_rx, if errors_open => match failed {
                    Ok(e) => break Err(e),
                    // The subscription ended without error; keep waiting for
                    // cancellation or the timeout.
                    Err(_) => errors_open = false,
                },
            }
        };

        match &outcome {
            Ok(WatchOutcome::Event(event)) => {
                debug!(path, revision = event.revision, action = %event.action, "watch delivered event");
                stop.raise();
            }
            Ok(WatchOutcome::TimedOut) => {
                debug!(path, ?timeout, "watch timed out");
                stop.raise();
            }
            Ok(WatchOutcome::Cancelled) => {
                debug!(path, "watch cancelled");
                stop.raise();
            }
            Err(e) => warn!(path, "watch failed: {e}"),
        }
        drop(events);
        self.reap(path, task);
        outcome
    }

    /// Detaches a stopped subscription. It gets the grace period to finish,
    /// then it is aborted.
    fn reap(&self, path: &str, mut task: JoinHandle<()>) {
        if task.is_finished() {
            return;
        }
        let grace = self.grace_period;
        let path = path.to_string();
        tokio::spawn(async move {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(path = %path, ?grace, "watch did not stop in time, aborting");
                task.abort();
            }
        });
    }
}
