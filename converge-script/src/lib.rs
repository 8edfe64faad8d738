//! Script-host surface of converge.
//!
//! A script host (the sandbox running user extensions) calls into converge
//! through two builtins, `sync_fetch` and `sync_watch`, implemented by
//! [`SyncBindings`]. Arguments and results are JSON values; failures are
//! [`ScriptError`]s carrying an [`ErrorKind`](converge_types::ErrorKind) the
//! host can turn into a catchable script exception.
//!
//! [`EnvironmentConfig`] reads the host's TOML environment file and
//! [`ScriptEnvironment`] wires the configured store and bindings together.

mod bindings;
mod config;
mod environment;
mod error;
mod logging;

pub use bindings::{SyncBindings, BUILTINS, SYNC_FETCH, SYNC_WATCH};
pub use config::{BackendKind, DatabaseConfig, EnvironmentConfig, SyncConfig};
pub use environment::ScriptEnvironment;
pub use error::{ConfigError, ConfigResult, ScriptError, ScriptResult};
pub use logging::init_tracing;
