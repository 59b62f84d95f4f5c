//! # propsync Bridge
//!
//! Bridges one networked appliance onto a smart-home accessory surface.
//!
//! ## Architecture
//!
//! Three cooperating pieces run under one runtime:
//! 1. **Poll loop**: fetches device properties on an interval, swaps the
//!    property cache, pushes attribute values, records history
//! 2. **Command loop**: consumes MQTT `set` topics and runs the engine's
//!    write path, hooks included
//! 3. **History log**: `SQLite`-backed time series with per-channel
//!    entry merging

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod host;
mod runtime;
mod tables;
mod topics;

pub use config::BridgeConfig;
pub use runtime::Bridge;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting propsync bridge"
    );

    let config = BridgeConfig::from_env()?;
    tracing::info!(
        model = %config.accessory.model,
        accessory = %config.accessory.name,
        "Bridge configured"
    );

    Bridge::new(config).run().await
}
