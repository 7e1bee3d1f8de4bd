//! Telemetry helpers for structured logging.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "prometheus_operations=info";

/// Install a fmt subscriber filtered by `RUST_LOG` (or [`DEFAULT_LOG_FILTER`]).
///
/// Does nothing if the application already installed a subscriber.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
