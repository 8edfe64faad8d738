//! Mailboxes connecting a watch caller to its background subscription.
//!
//! - [`EventSink`]: bounded event buffer with non-blocking hand-off; a full
//!   buffer drops the event at the producer
//! - [`StopSignal`] / [`StopListener`]: capacity-1 stop mailbox raised by the
//!   caller and observed by the subscription
//! - [`CancelHandle`] / [`CancelSignal`]: external cancellation of an
//!   in-flight bridge call (script interrupt, request shutdown)

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::node::SyncEvent;

/// Default capacity of the event buffer between a subscription and its
/// caller.
pub const DEFAULT_EVENT_BUFFER: usize = 32;

/// Result of offering one event to an [`EventSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The buffer was full; the event is gone.
    Dropped,
    /// The receiving side is gone; the subscription should end.
    Closed,
}

/// Producer half of the event buffer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SyncEvent>,
}

/// Creates an event buffer holding up to `capacity` events (at least one).
pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<SyncEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

impl EventSink {
    /// Hands `event` over without waiting.
    pub fn offer(&self, event: SyncEvent) -> Delivery {
        match self.tx.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(key = %event.key, revision = event.revision, "event buffer full, dropping event");
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Caller half of the stop mailbox.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: mpsc::Sender<()>,
}

/// Subscription half of the stop mailbox.
#[derive(Debug)]
pub struct StopListener {
    rx: mpsc::Receiver<()>,
}

/// Creates a stop mailbox of capacity 1.
pub fn stop_channel() -> (StopSignal, StopListener) {
    let (tx, rx) = mpsc::channel(1);
    (StopSignal { tx }, StopListener { rx })
}

impl StopSignal {
    /// Raises stop. Raising twice is the same as raising once.
    pub fn raise(&self) {
        // Full means a stop is already pending; closed means the
        // subscription is gone. Neither needs more work.
        let _ = self.tx.try_send(());
    }
}

impl StopListener {
    /// Resolves when stop is raised or every [`StopSignal`] is dropped.
    pub async fn stopped(&mut self) {
        let _ = self.rx.recv().await;
    }

    /// Non-blocking check.
    pub fn is_stopped(&mut self) -> bool {
        !matches!(self.rx.try_recv(), Err(mpsc::error::TryRecvError::Empty))
    }
}

/// Requests cancellation of every [`CancelSignal`] cloned from its pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observes a [`CancelHandle`]. Cloneable; every clone sees the same
/// cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Creates a cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the value at `false` forever.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
