//! Isolation level resolution.
//!
//! Reads tolerate a weaker guarantee; every other action defaults to the
//! strongest level because resource graphs carry cross-entity relations whose
//! consistency must survive concurrent writers. A schema can override either
//! default per action.

use converge_types::{IsolationLevel, Schema, SchemaRegistry};

use crate::error::DbResult;

/// The action name that resolves to [`IsolationLevel::RepeatableRead`].
pub const READ_ACTION: &str = "read";

/// Returns the isolation level for running `action` against `schema`.
///
/// A declared override is returned verbatim. Otherwise `"read"` maps to
/// `RepeatableRead` and anything else to `Serializable`.
pub fn resolve_isolation(schema: &Schema, action: &str) -> IsolationLevel {
    if let Some(level) = schema.isolation_override(action) {
        return level;
    }
    match action {
        READ_ACTION => IsolationLevel::RepeatableRead,
        _ => IsolationLevel::Serializable,
    }
}

/// Resolves through a registry, failing when the schema is unknown.
pub fn resolve_for(
    registry: &SchemaRegistry,
    schema_id: &str,
    action: &str,
) -> DbResult<IsolationLevel> {
    let schema = registry.require(schema_id)?;
    Ok(resolve_isolation(schema, action))
}
