//! Diagnostic tracing for the host and the worker.
//!
//! Both binaries log to stderr only. For the worker this matters: stdout is the
//! protocol stream, and the host keeps a bounded tail of stderr to explain
//! unexpected exits.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=rlm=debug rlm exec --code 'print(1);'
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // `try_init` so tests and embedders that already installed a subscriber keep it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
