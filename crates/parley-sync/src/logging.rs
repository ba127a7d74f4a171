use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "parley_sync=debug,parley_remote=debug,parley_store=info,warn";

/// Install a fmt subscriber filtered by `RUST_LOG`, or by a default filter
/// when it is unset. Later calls are no-ops, so embedders and tests can
/// call this freely.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("tracing initialised");
    }
}
