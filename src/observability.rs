//! Logging setup and the `#[obs]` span attribute.

pub use dripline_observability_macros::obs;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global fmt subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }
}
