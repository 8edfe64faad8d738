use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TypesError, TypesResult};

/// A schema-typed property bag.
///
/// The identifier is unique within the schema and is always mirrored into
/// `properties["id"]` so that filters on `"id"` behave like filters on any
/// other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    schema_id: String,
    id: String,
    properties: Map<String, Value>,
}

impl Resource {
    pub fn new(schema_id: impl Into<String>, id: impl Into<String>, mut properties: Map<String, Value>) -> Self {
        let id = id.into();
        properties.insert("id".to_string(), Value::String(id.clone()));
        Self {
            schema_id: schema_id.into(),
            id,
            properties,
        }
    }

    /// Builds a resource from a JSON object carrying a string `"id"`.
    pub fn from_value(schema_id: impl Into<String>, value: Value) -> TypesResult<Self> {
        let Value::Object(properties) = value else {
            return Err(TypesError::InvalidResource(
                "resource body must be a JSON object".into(),
            ));
        };
        let id = match properties.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => {
                return Err(TypesError::InvalidResource("\"id\" must be a non-empty string".into()));
            }
            None => return Err(TypesError::InvalidResource("missing \"id\"".into())),
        };
        Ok(Self::new(schema_id, id, properties))
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Returns a property value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.properties.get(field)
    }

    /// Extracts a string property.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Sets a property. Writing `"id"` is ignored; the identifier is fixed at
    /// construction.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        if field == "id" {
            return;
        }
        self.properties.insert(field, value);
    }

    /// The resource as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.properties.clone())
    }
}
