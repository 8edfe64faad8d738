use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber for the whole process.
///
/// `RUST_LOG` overrides the level picked by `verbose`. Returns `false` if a
/// global subscriber was already installed.
pub fn init_tracing(verbose: bool) -> bool {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
