//! Diagnostic tracing for the agent.
//!
//! Logs go to stderr and are controlled by `RUST_LOG`. Progress meant for the
//! caller travels over the session event stream instead.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `mender=info,warn` if unset.
///
/// ```bash
/// RUST_LOG=mender=debug mender run "add a pricing page"
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mender=info,warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
