use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::resource::Resource;

/// Selects resources by field equality.
///
/// Keys are unique. A list value matches when the field equals any of its
/// elements; an empty filter matches every resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

/// The canonical single-key filter `{"id": id}`.
pub fn id_filter(id: impl Into<Value>) -> Filter {
    Filter::new().with("id", id)
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) one expected value.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the id when this is exactly `{"id": <string>}`.
    pub fn as_id(&self) -> Option<&str> {
        if self.0.len() != 1 {
            return None;
        }
        self.0.get("id").and_then(Value::as_str)
    }

    /// Whether `resource` satisfies every entry.
    pub fn matches(&self, resource: &Resource) -> bool {
        self.0.iter().all(|(field, expected)| {
            let actual = resource.get(field);
            match expected {
                Value::Array(candidates) => {
                    actual.is_some_and(|a| candidates.iter().any(|c| c == a))
                }
                Value::Null => actual.is_none_or(Value::is_null),
                other => actual == Some(other),
            }
        })
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Filter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
