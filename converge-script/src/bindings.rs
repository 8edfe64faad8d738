//! The `sync_fetch` / `sync_watch` builtins exposed to scripts.
//!
//! Arguments arrive as JSON values from the script host. Arity and argument
//! types are checked before any call reaches the coordination tree.

use converge_sync::{normalize_path, CancelSignal, SyncBridge, WatchOutcome};
use converge_types::ErrorKind;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::{ScriptError, ScriptResult};

pub const SYNC_FETCH: &str = "sync_fetch";
pub const SYNC_WATCH: &str = "sync_watch";

/// Names of every builtin [`SyncBindings::call`] dispatches.
pub const BUILTINS: [&str; 2] = [SYNC_FETCH, SYNC_WATCH];

const ORDINALS: [&str; 3] = ["first", "second", "third"];

fn check_arity(function: &str, args: &[Value], expected: usize) -> ScriptResult<()> {
    if args.len() != expected {
        return Err(ScriptError::argument(
            function,
            format!(
                "Expected {expected} arguments in {function} call, {} arguments given",
                args.len()
            ),
        ));
    }
    Ok(())
}

fn string_arg<'a>(function: &str, args: &'a [Value], index: usize) -> ScriptResult<&'a str> {
    args[index].as_str().ok_or_else(|| {
        ScriptError::argument(
            function,
            format!("Invalid type of {} argument: expected a string", ORDINALS[index]),
        )
    })
}

/// A string argument that must also be a well-formed tree path.
fn path_arg(function: &str, args: &[Value], index: usize) -> ScriptResult<String> {
    let raw = string_arg(function, args, index)?;
    normalize_path(raw).map_err(|_| {
        ScriptError::argument(
            function,
            format!("Invalid {} argument: {raw:?} is not a valid sync path", ORDINALS[index]),
        )
    })
}

/// Script numbers may arrive as floats; whole values are accepted.
fn int_arg(function: &str, args: &[Value], index: usize) -> ScriptResult<i64> {
    let value = &args[index];
    let whole = value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f as i64)
    });
    whole.ok_or_else(|| {
        ScriptError::argument(
            function,
            format!("Invalid type of {} argument: expected an integer", ORDINALS[index]),
        )
    })
}

/// Sync builtins bound to one bridge.
#[derive(Clone)]
pub struct SyncBindings {
    bridge: SyncBridge,
}

impl SyncBindings {
    pub fn new(bridge: SyncBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }

    /// Dispatches a builtin by name.
    pub async fn call(
        &self,
        name: &str,
        args: &[Value],
        cancel: &mut CancelSignal,
    ) -> ScriptResult<Value> {
        match name {
            SYNC_FETCH => self.sync_fetch(args, cancel).await,
            SYNC_WATCH => self.sync_watch(args, cancel).await,
            other => Err(ScriptError::UnknownFunction(other.to_string())),
        }
    }

    /// `sync_fetch(path)` returns `{key, value, revision, children}`, or
    /// `null` if the call was cancelled.
    pub async fn sync_fetch(&self, args: &[Value], cancel: &mut CancelSignal) -> ScriptResult<Value> {
        check_arity(SYNC_FETCH, args, 1)?;
        let path = path_arg(SYNC_FETCH, args, 0)?;
        let path = path.as_str();

        let fetched = self
            .bridge
            .fetch(path, cancel)
            .await
            .map_err(|source| ScriptError::Sync {
                context: "Failed to fetch sync",
                source,
            })?;
        match fetched {
            Some(node) => node.to_value().map_err(|source| ScriptError::Sync {
                context: "Failed to fetch sync",
                source,
            }),
            None => {
                debug!(path, kind = %ErrorKind::WatchCancelled, "sync_fetch interrupted");
                Ok(Value::Null)
            }
        }
    }

    /// `sync_watch(path, timeout_msec, revision)` returns the next event
    /// `{action, key, data, revision}` newer than `revision`, or `{}` on
    /// timeout or cancellation.
    pub async fn sync_watch(&self, args: &[Value], cancel: &mut CancelSignal) -> ScriptResult<Value> {
        check_arity(SYNC_WATCH, args, 3)?;
        let path = path_arg(SYNC_WATCH, args, 0)?;
        let path = path.as_str();
        let timeout_msec = int_arg(SYNC_WATCH, args, 1)?;
        let revision = int_arg(SYNC_WATCH, args, 2)?;
        let timeout_msec = u64::try_from(timeout_msec).map_err(|_| {
            ScriptError::argument(SYNC_WATCH, "Invalid second argument: timeout must not be negative")
        })?;

        let outcome = self
            .bridge
            .watch(path, revision, Duration::from_millis(timeout_msec), cancel)
            .await
            .map_err(|source| ScriptError::Sync {
                context: "Sync watch failed",
                source,
            })?;
        match outcome {
            WatchOutcome::Event(event) => event.to_value().map_err(|source| ScriptError::Sync {
                context: "Sync watch failed",
                source,
            }),
            WatchOutcome::TimedOut => Ok(Value::Object(Map::new())),
            WatchOutcome::Cancelled => {
                debug!(path, kind = %ErrorKind::WatchCancelled, "sync_watch interrupted");
                Ok(Value::Object(Map::new()))
            }
        }
    }
}
