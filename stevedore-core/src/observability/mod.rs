//! Observability infrastructure: tracing subscriber and metric descriptions.
//!
//! The core only records through the `tracing` and `metrics` facades; the
//! binary decides whether anything is installed to receive them.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Map a `-v` count to a default log directive.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `verbosity` when set. Calling this twice returns an
/// error instead of panicking.
pub fn init(verbosity: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbosity)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(verbosity > 0).with_level(true))
        .try_init()?;

    metrics::register_core_metrics();
    tracing::debug!(verbosity, "Observability initialized");
    Ok(())
}
