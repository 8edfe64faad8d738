use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::resource::Resource;

/// Sort direction for a [`Paginator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Offset/limit/sort window applied to a list query.
///
/// The total count returned alongside a page always counts every matching
/// resource, not just the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginator {
    pub key: String,
    pub order: SortOrder,
    /// `None` returns every row after `offset`.
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            key: "id".to_string(),
            order: SortOrder::Asc,
            limit: None,
            offset: 0,
        }
    }
}

impl Paginator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sorted_by(mut self, key: impl Into<String>, order: SortOrder) -> Self {
        self.key = key.into();
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Sorts `resources` and cuts the page out of them.
    pub fn apply(&self, mut resources: Vec<Resource>) -> Vec<Resource> {
        resources.sort_by(|a, b| {
            let ord = compare_values(a.get(&self.key), b.get(&self.key))
                .then_with(|| a.id().cmp(b.id()));
            match self.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        let offset = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let page = resources.into_iter().skip(offset);
        match self.limit {
            Some(limit) => page.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect(),
            None => page.collect(),
        }
    }
}

/// Orders two optional JSON values: missing and null first, then numbers
/// numerically, strings lexically, anything else by its JSON text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        _ => Ordering::Equal,
    }
}
