//! Core type definitions for converge.
//!
//! This crate provides the shared vocabulary used by the transactional store
//! (`converge-db`) and the coordination-tree client (`converge-sync`):
//!
//! - [`Schema`] / [`SchemaRegistry`]: schema descriptions and an explicitly
//!   passed, read-only registry of them
//! - [`Resource`]: a schema-typed property bag
//! - [`Filter`] / [`Paginator`]: row selection and page shaping
//! - [`ResourceState`]: the observed-state companion of a resource, and the
//!   [`Convergence`] model derived from it
//! - [`ErrorKind`]: the programmatic error taxonomy shared by every crate

mod error;
mod filter;
mod isolation;
mod paginator;
mod resource;
mod schema;
mod state;

pub use error::{ErrorKind, TypesError, TypesResult};
pub use filter::{id_filter, Filter};
pub use isolation::{IsolationLevel, LockPolicy};
pub use paginator::{compare_values, Paginator, SortOrder};
pub use resource::Resource;
pub use schema::{Relation, Schema, SchemaRegistry};
pub use state::{Convergence, ResourceState};
