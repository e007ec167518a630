//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// `default_level` applies unless `VIGIL_LOG` overrides it.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed.
pub fn init(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("VIGIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("could not install tracing subscriber: {err}"))
}
