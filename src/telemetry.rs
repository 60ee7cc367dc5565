//! Logging initialization.
//!
//! Metrics/log export to an external collector is a collaborator's responsibility,
//! not this crate's; this module only wires up structured console logging.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize tracing with an `EnvFilter` (`RUST_LOG`, defaulting to `info`) and a
/// plain console formatter.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
