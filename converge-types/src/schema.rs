use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{TypesError, TypesResult};
use crate::isolation::IsolationLevel;

/// Describes a resource type: its id, per-action isolation overrides and the
/// relations that lock cascading follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    /// Explicit isolation level per action (`"read"`, `"create"`, ...).
    /// Actions absent from this map use the resolver's defaults.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub isolation_levels: HashMap<String, IsolationLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
}

/// A property whose value is the id of a resource in another schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Property on the owning resource holding the related id.
    pub property: String,
    /// Schema of the related resource.
    pub schema_id: String,
}

impl Schema {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            isolation_levels: HashMap::new(),
            relations: Vec::new(),
        }
    }

    /// Declares an isolation override for one action.
    pub fn with_isolation_level(mut self, action: impl Into<String>, level: IsolationLevel) -> Self {
        self.isolation_levels.insert(action.into(), level);
        self
    }

    /// Declares a relation to another schema through `property`.
    pub fn with_relation(mut self, property: impl Into<String>, schema_id: impl Into<String>) -> Self {
        self.relations.push(Relation {
            property: property.into(),
            schema_id: schema_id.into(),
        });
        self
    }

    /// Returns the declared override for `action`, if any.
    pub fn isolation_override(&self, action: &str) -> Option<IsolationLevel> {
        self.isolation_levels.get(action).copied()
    }
}

/// Read-only collection of schemas, threaded explicitly through call sites.
///
/// Built once by the schema loader and then shared by reference; there is no
/// process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a list, rejecting duplicate ids.
    pub fn from_schemas(schemas: impl IntoIterator<Item = Schema>) -> TypesResult<Self> {
        let mut registry = Self::new();
        for schema in schemas {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, schema: Schema) -> TypesResult<()> {
        if self.schemas.contains_key(&schema.id) {
            return Err(TypesError::DuplicateSchema(schema.id));
        }
        self.schemas.insert(schema.id.clone(), schema);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Schema> {
        self.schemas.get(id)
    }

    /// Like [`get`](Self::get) but failing with `UnknownSchema`.
    pub fn require(&self, id: &str) -> TypesResult<&Schema> {
        self.get(id)
            .ok_or_else(|| TypesError::UnknownSchema(id.to_string()))
    }

    /// Schemas in id order.
    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
