use async_trait::async_trait;
use converge_sync::{
    cancel_pair, CancelSignal, Delivery, EventSink, MemorySyncTree, StopListener, SyncAction,
    SyncBackend, SyncBridge, SyncError, SyncEvent, SyncNode, SyncResult, WatchOutcome,
};
use converge_types::ErrorKind;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn event(revision: i64) -> SyncEvent {
    SyncEvent {
        action: SyncAction::Updated,
        key: format!("/cfg/k{revision}"),
        data: Value::Null,
        revision,
    }
}

/// Offers a fixed list of events, then fails or waits for stop.
#[derive(Default)]
struct ScriptedBackend {
    events: Vec<SyncEvent>,
    failure: Option<String>,
    ignore_stop: bool,
    hang_fetch: bool,
    deliveries: Mutex<Vec<Delivery>>,
    stopped: AtomicBool,
    /// Set when the watch future ends, whether it returned or was aborted.
    released: AtomicBool,
}

struct ReleaseOnDrop<'a>(&'a AtomicBool);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    fn with_events(revisions: impl IntoIterator<Item = i64>) -> Self {
        Self {
            events: revisions.into_iter().map(event).collect(),
            ..Self::default()
        }
    }

    fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncBackend for ScriptedBackend {
    async fn fetch(&self, path: &str) -> SyncResult<SyncNode> {
        if self.hang_fetch {
            std::future::pending::<()>().await;
        }
        Err(SyncError::NotFound(path.to_string()))
    }

    async fn watch(
        &self,
        _path: &str,
        _revision: i64,
        sink: EventSink,
        mut stop: StopListener,
    ) -> SyncResult<()> {
        let _release = ReleaseOnDrop(&self.released);
        for event in &self.events {
            let delivery = sink.offer(event.clone());
            self.deliveries.lock().unwrap().push(delivery);
        }
        if let Some(reason) = &self.failure {
            return Err(SyncError::Unavailable(reason.clone()));
        }
        if self.ignore_stop {
            std::future::pending::<()>().await;
        }
        stop.stopped().await;
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn tree_with_gaps() -> MemorySyncTree {
    let tree = MemorySyncTree::new();
    for (key, value) in [
        ("/other/a", "1"),
        ("/other/b", "1"),
        ("/cfg/a", "1"),
        ("/other/a", "2"),
        ("/other/b", "2"),
        ("/cfg/b", "1"),
        ("/cfg/a", "2"),
        ("/other/c", "1"),
        ("/cfg/c", "1"),
    ] {
        tree.put(key, value).unwrap();
    }
    tree
}

const LONG: Duration = Duration::from_secs(10);

/// Lets detached subscription tasks observe stop and finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ── Events ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn successive_calls_walk_revisions() {
    let tree = tree_with_gaps();
    let bridge = SyncBridge::new(Arc::new(tree.clone()));
    let mut cancel = CancelSignal::never();

    let mut seen = Vec::new();
    let mut revision = 5;
    loop {
        match bridge.watch("/cfg", revision, LONG, &mut cancel).await.unwrap() {
            WatchOutcome::Event(event) => {
                revision = event.revision;
                seen.push(revision);
            }
            WatchOutcome::TimedOut => break,
            WatchOutcome::Cancelled => panic!("never cancelled"),
        }
    }
    assert_eq!(seen, vec![6, 7, 9]);
    settle().await;
    assert_eq!(tree.watcher_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn live_event_wakes_the_watch() {
    let tree = MemorySyncTree::new();
    let bridge = SyncBridge::new(Arc::new(tree.clone()));

    let writer = {
        let tree = tree.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tree.put("/cfg/net", r#"{"cidr":"10.0.0.0/24"}"#).unwrap();
        })
    };

    let outcome = bridge
        .watch("/cfg", 0, LONG, &mut CancelSignal::never())
        .await
        .unwrap();
    let event = outcome.into_event().unwrap();
    assert_eq!(event.key, "/cfg/net");
    assert_eq!(event.data["cidr"], "10.0.0.0/24");
    assert_eq!(
        event.to_value().unwrap(),
        serde_json::json!({
            "action": "created",
            "key": "/cfg/net",
            "data": { "cidr": "10.0.0.0/24" },
            "revision": 1
        })
    );
    writer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn bridge_skips_stale_revisions() {
    let backend = Arc::new(ScriptedBackend::with_events([3, 5, 6, 8]));
    let bridge = SyncBridge::new(backend.clone());

    let outcome = bridge
        .watch("/cfg", 5, LONG, &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::Event(event(6)));
    settle().await;
    assert!(backend.stopped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn saturated_buffer_drops_excess_events() {
    let backend = Arc::new(ScriptedBackend::with_events(1..=40));
    let bridge = SyncBridge::new(backend.clone());
    assert_eq!(bridge.event_buffer(), 32);

    let outcome = bridge
        .watch("/cfg", 0, LONG, &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::Event(event(1)));

    let deliveries = backend.deliveries();
    assert_eq!(deliveries.len(), 40);
    assert_eq!(deliveries.iter().filter(|d| **d == Delivery::Delivered).count(), 32);
    assert_eq!(deliveries.iter().filter(|d| **d == Delivery::Dropped).count(), 8);
}

#[tokio::test(start_paused = true)]
async fn event_buffer_is_configurable() {
    let backend = Arc::new(ScriptedBackend::with_events(1..=5));
    let bridge = SyncBridge::new(backend.clone()).with_event_buffer(2);

    bridge
        .watch("/cfg", 0, LONG, &mut CancelSignal::never())
        .await
        .unwrap();
    let dropped = backend
        .deliveries()
        .into_iter()
        .filter(|d| *d == Delivery::Dropped)
        .count();
    assert_eq!(dropped, 3);
}

// ── Timeout & cancellation ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timeout_returns_empty_and_stops_subscription() {
    let tree = MemorySyncTree::new();
    let bridge = SyncBridge::new(Arc::new(tree.clone()));

    let started = Instant::now();
    let outcome = bridge
        .watch("/cfg", 0, Duration::from_millis(500), &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < LONG);
    settle().await;
    assert_eq!(tree.watcher_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_wins_and_stops_subscription() {
    let backend = Arc::new(ScriptedBackend::default());
    let bridge = SyncBridge::new(backend.clone());
    let (handle, mut cancel) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let outcome = bridge.watch("/cfg", 0, LONG, &mut cancel).await.unwrap();
    assert_eq!(outcome, WatchOutcome::Cancelled);
    assert!(started.elapsed() < LONG);
    settle().await;
    assert!(backend.stopped.load(Ordering::SeqCst));
    canceller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_beats_a_ready_event() {
    let backend = Arc::new(ScriptedBackend::with_events([1]));
    let bridge = SyncBridge::new(backend);
    let (handle, mut cancel) = cancel_pair();
    handle.cancel();

    let outcome = bridge.watch("/cfg", 0, LONG, &mut cancel).await.unwrap();
    assert_eq!(outcome, WatchOutcome::Cancelled);
    assert!(cancel.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn timeout_does_not_wait_for_unresponsive_subscription() {
    let backend = Arc::new(ScriptedBackend {
        ignore_stop: true,
        ..ScriptedBackend::default()
    });
    let bridge = SyncBridge::new(backend.clone());

    let started = Instant::now();
    let outcome = bridge
        .watch("/cfg", 0, Duration::from_millis(10), &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert!(started.elapsed() < Duration::from_millis(20));
    assert!(!backend.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn cancel_does_not_wait_for_unresponsive_subscription() {
    let backend = Arc::new(ScriptedBackend {
        ignore_stop: true,
        ..ScriptedBackend::default()
    });
    let bridge = SyncBridge::new(backend.clone()).with_grace_period(LONG);
    let (handle, mut cancel) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
    });
    let started = Instant::now();
    let outcome = bridge.watch("/cfg", 0, LONG, &mut cancel).await.unwrap();
    assert_eq!(outcome, WatchOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(40));
    canceller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unresponsive_subscription_is_aborted_after_grace() {
    let backend = Arc::new(ScriptedBackend {
        ignore_stop: true,
        ..ScriptedBackend::default()
    });
    let bridge = SyncBridge::new(backend.clone()).with_grace_period(Duration::from_millis(500));

    bridge
        .watch("/cfg", 0, Duration::from_millis(10), &mut CancelSignal::never())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!backend.released.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(backend.released.load(Ordering::SeqCst));
    assert!(!backend.stopped.load(Ordering::SeqCst));
}

// ── Errors ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscription_error_is_surfaced() {
    let backend = Arc::new(ScriptedBackend {
        failure: Some("link down".into()),
        ..ScriptedBackend::default()
    });
    let bridge = SyncBridge::new(backend);

    let err = bridge
        .watch("/cfg", 0, LONG, &mut CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unavailable(ref r) if r == "link down"));
    assert_eq!(err.kind(), ErrorKind::SyncUnavailable);
}

#[tokio::test(start_paused = true)]
async fn buffered_event_wins_over_error() {
    let backend = Arc::new(ScriptedBackend {
        events: vec![event(4)],
        failure: Some("link down".into()),
        ..ScriptedBackend::default()
    });
    let bridge = SyncBridge::new(backend);

    let outcome = bridge
        .watch("/cfg", 0, LONG, &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::Event(event(4)));
}

#[tokio::test(start_paused = true)]
async fn link_loss_mid_watch_fails_the_call() {
    let tree = MemorySyncTree::new();
    let bridge = SyncBridge::new(Arc::new(tree.clone()));

    let breaker = {
        let tree = tree.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tree.fail_link("reset by peer").unwrap();
        })
    };

    let err = bridge
        .watch("/cfg", 0, LONG, &mut CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyncUnavailable);
    breaker.await.unwrap();
    assert_eq!(tree.watcher_count(), 0);
}

// ── Fetch ───────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_through_bridge() {
    let tree = tree_with_gaps();
    let bridge = SyncBridge::new(Arc::new(tree));

    let node = bridge
        .fetch("/cfg/a", &mut CancelSignal::never())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.value, "2");
    assert_eq!(node.revision, 7);

    let err = bridge
        .fetch("/missing", &mut CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn cancelled_fetch_returns_nothing() {
    let backend = Arc::new(ScriptedBackend {
        hang_fetch: true,
        ..ScriptedBackend::default()
    });
    let bridge = SyncBridge::new(backend);
    let (handle, mut cancel) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let node = bridge.fetch("/cfg", &mut cancel).await.unwrap();
    assert!(node.is_none());
    canceller.await.unwrap();
}
