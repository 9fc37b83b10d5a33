//! Tracing setup for binaries embedding the engine.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
