use converge_script::{ScriptError, SyncBindings, BUILTINS};
use converge_sync::{cancel_pair, CancelSignal, MemorySyncTree, SyncBridge};
use converge_types::ErrorKind;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn bindings(tree: &MemorySyncTree) -> SyncBindings {
    SyncBindings::new(SyncBridge::new(Arc::new(tree.clone())))
}

fn seeded_tree() -> MemorySyncTree {
    let tree = MemorySyncTree::new();
    tree.put("/cfg/net/n1", r#"{"name":"alpha"}"#).unwrap(); // 1
    tree.put("/cfg/net/n2", r#"{"name":"beta"}"#).unwrap(); // 2
    tree.put("/cfg/net/n1", r#"{"name":"gamma"}"#).unwrap(); // 3
    tree
}

/// Lets detached subscription tasks observe stop and finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn assert_argument_error(err: ScriptError, message: &str) {
    assert_eq!(err.kind(), ErrorKind::Argument);
    match err {
        ScriptError::Argument { message: got, .. } => assert_eq!(got, message),
        other => panic!("expected an argument error, got {other:?}"),
    }
}

// ── Argument validation ─────────────────────────────────────────

#[tokio::test]
async fn fetch_checks_arity_before_io() {
    let tree = MemorySyncTree::new();
    // A broken link would fail any call that reached the tree.
    tree.fail_link("down").unwrap();
    let b = bindings(&tree);
    let mut cancel = CancelSignal::never();

    let err = b.sync_fetch(&[], &mut cancel).await.unwrap_err();
    assert_argument_error(err, "Expected 1 arguments in sync_fetch call, 0 arguments given");

    let err = b
        .sync_fetch(&[json!("/a"), json!("/b")], &mut cancel)
        .await
        .unwrap_err();
    assert_argument_error(err, "Expected 1 arguments in sync_fetch call, 2 arguments given");

    let err = b.sync_fetch(&[json!(42)], &mut cancel).await.unwrap_err();
    assert_argument_error(err, "Invalid type of first argument: expected a string");
}

#[tokio::test]
async fn watch_checks_argument_types_before_io() {
    let tree = MemorySyncTree::new();
    tree.fail_link("down").unwrap();
    let b = bindings(&tree);
    let mut cancel = CancelSignal::never();

    let err = b.sync_watch(&[json!("/cfg")], &mut cancel).await.unwrap_err();
    assert_argument_error(err, "Expected 3 arguments in sync_watch call, 1 arguments given");

    let err = b
        .sync_watch(&[json!(1), json!(100), json!(0)], &mut cancel)
        .await
        .unwrap_err();
    assert_argument_error(err, "Invalid type of first argument: expected a string");

    let err = b
        .sync_watch(&[json!("/cfg"), json!("soon"), json!(0)], &mut cancel)
        .await
        .unwrap_err();
    assert_argument_error(err, "Invalid type of second argument: expected an integer");

    let err = b
        .sync_watch(&[json!("/cfg"), json!(100), json!(1.5)], &mut cancel)
        .await
        .unwrap_err();
    assert_argument_error(err, "Invalid type of third argument: expected an integer");

    let err = b
        .sync_watch(&[json!("/cfg"), json!(-1), json!(0)], &mut cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
}

#[tokio::test]
async fn malformed_paths_are_rejected_before_io() {
    let tree = MemorySyncTree::new();
    tree.fail_link("down").unwrap();
    let b = bindings(&tree);
    let mut cancel = CancelSignal::never();

    let err = b.sync_fetch(&[json!("")], &mut cancel).await.unwrap_err();
    assert_argument_error(err, r#"Invalid first argument: "" is not a valid sync path"#);

    let err = b.sync_fetch(&[json!("/cfg/../etc")], &mut cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);

    let err = b
        .sync_watch(&[json!("/cfg/./net"), json!(100), json!(0)], &mut cancel)
        .await
        .unwrap_err();
    assert_argument_error(err, r#"Invalid first argument: "/cfg/./net" is not a valid sync path"#);
    assert_eq!(tree.watcher_count(), 0);
}

#[tokio::test]
async fn unknown_builtin_is_argument_error() {
    let b = bindings(&MemorySyncTree::new());
    let err = b
        .call("sync_delete", &[json!("/cfg")], &mut CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, ScriptError::UnknownFunction(ref name) if name == "sync_delete"));
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(BUILTINS, ["sync_fetch", "sync_watch"]);
}

// ── sync_fetch ──────────────────────────────────────────────────

#[tokio::test]
async fn fetch_returns_node_object() {
    let b = bindings(&seeded_tree());
    let node = b
        .call("sync_fetch", &[json!("/cfg/net")], &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(
        node,
        json!({
            "key": "/cfg/net",
            "value": "",
            "revision": 0,
            "children": [
                { "key": "/cfg/net/n1", "value": r#"{"name":"gamma"}"#, "revision": 3, "children": [] },
                { "key": "/cfg/net/n2", "value": r#"{"name":"beta"}"#, "revision": 2, "children": [] }
            ]
        })
    );
}

#[tokio::test]
async fn fetch_failure_is_catchable() {
    let b = bindings(&seeded_tree());
    let err = b
        .sync_fetch(&[json!("/missing")], &mut CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().starts_with("Failed to fetch sync: "));
}

#[tokio::test]
async fn cancelled_fetch_returns_null() {
    let b = bindings(&seeded_tree());
    let (handle, mut cancel) = cancel_pair();
    handle.cancel();
    let value = b.sync_fetch(&[json!("/cfg")], &mut cancel).await.unwrap();
    assert_eq!(value, Value::Null);
}

// ── sync_watch ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn watch_returns_event_object() {
    let b = bindings(&seeded_tree());
    let event = b
        .call(
            "sync_watch",
            &[json!("/cfg/net"), json!(1000), json!(2)],
            &mut CancelSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(
        event,
        json!({
            "action": "updated",
            "key": "/cfg/net/n1",
            "data": { "name": "gamma" },
            "revision": 3
        })
    );
}

#[tokio::test(start_paused = true)]
async fn watch_accepts_whole_float_numbers() {
    let b = bindings(&seeded_tree());
    let event = b
        .sync_watch(
            &[json!("/cfg"), json!(1000.0), json!(0.0)],
            &mut CancelSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(event["revision"], 1);
}

#[tokio::test(start_paused = true)]
async fn watch_timeout_returns_empty_object() {
    let tree = seeded_tree();
    let b = bindings(&tree);
    let value = b
        .sync_watch(&[json!("/cfg"), json!(250), json!(3)], &mut CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(value, json!({}));
    settle().await;
    assert_eq!(tree.watcher_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn watch_cancellation_returns_empty_object() {
    let tree = seeded_tree();
    let b = bindings(&tree);
    let (handle, mut cancel) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });
    let value = b
        .sync_watch(&[json!("/cfg"), json!(60_000), json!(3)], &mut cancel)
        .await
        .unwrap();
    assert_eq!(value, json!({}));
    settle().await;
    assert_eq!(tree.watcher_count(), 0);
    canceller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn watch_error_is_catchable() {
    let tree = seeded_tree();
    let b = bindings(&tree);

    let breaker = {
        let tree = tree.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tree.fail_link("connection reset").unwrap();
        })
    };
    let err = b
        .sync_watch(&[json!("/cfg"), json!(60_000), json!(3)], &mut CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyncUnavailable);
    assert!(err.to_string().starts_with("Sync watch failed: "));
    breaker.await.unwrap();
}
