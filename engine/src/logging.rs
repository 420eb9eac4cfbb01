//! Development-time tracing for the engine.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is not the
//! product record of a turn; that is the JSON written by `io/turn_log` when a
//! history directory is configured.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// # Example
/// ```bash
/// RUST_LOG=dyad_engine=debug dyad-engine apply --root ./app response.txt
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
