//! Diagnostic tracing for the crew CLI.
//!
//! Attempt failures, backoff delays, cache hits and backend runs are emitted as
//! `tracing` events. Task results go to stdout; diagnostics go to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `crew=info` if unset so retry progress is
/// visible. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=crew=debug crew run --query "..." --description "..."
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crew=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
