//! Snapshot and change-event types of the coordination tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// One key of a fetched subtree.
///
/// `revision` is the revision at which this key itself last changed; it is
/// not an aggregate over `children`. Intermediate directories that were never
/// written directly carry revision 0 and an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNode {
    pub key: String,
    pub value: String,
    pub revision: i64,
    #[serde(default)]
    pub children: Vec<SyncNode>,
}

impl SyncNode {
    /// Finds a descendant (or self) by full key.
    pub fn find(&self, key: &str) -> Option<&SyncNode> {
        if self.key == key {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(key))
    }

    /// Total number of nodes in this subtree, self included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(SyncNode::node_count).sum::<usize>()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The node as a script object: `{key, value, revision, children}`.
    pub fn to_value(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Created => "created",
            SyncAction::Updated => "updated",
            SyncAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation observed under a watched path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub action: SyncAction,
    pub key: String,
    /// The new value decoded as JSON, the raw string when it is not JSON,
    /// `null` for deletions.
    pub data: Value,
    pub revision: i64,
}

impl SyncEvent {
    /// Builds an event from the raw stored value.
    pub fn from_raw(action: SyncAction, key: impl Into<String>, raw: Option<&str>, revision: i64) -> Self {
        let data = match raw {
            None => Value::Null,
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        };
        Self {
            action,
            key: key.into(),
            data,
            revision,
        }
    }

    /// The event as a script object: `{action, key, data, revision}`.
    pub fn to_value(&self) -> SyncResult<Value> {
        serde_json::to_value(self).map_err(SyncError::from)
    }
}

/// Normalizes a tree path: one leading `/`, no trailing `/`, no empty
/// segments. The root is `/`.
pub fn normalize_path(path: &str) -> SyncResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidPath(path.to_string()));
    }
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(SyncError::InvalidPath(path.to_string()));
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Whether `key` is `path` itself or lies below it.
pub fn is_under(key: &str, path: &str) -> bool {
    if path == "/" {
        return true;
    }
    key == path || key.strip_prefix(path).is_some_and(|rest| rest.starts_with('/'))
}
