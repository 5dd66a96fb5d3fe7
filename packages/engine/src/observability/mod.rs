// packages/engine/src/observability/mod.rs
//! Tracing setup
//!
//! Filter precedence: `RELAYPOOL_LOG`, then `RUST_LOG`, then the configured
//! level. Output is either human-readable or JSON lines on stderr (stdout
//! belongs to the runner's responses and, for pipe workers, to the relay).

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable carrying the engine's log filter
pub const LOG_ENV: &str = "RELAYPOOL_LOG";

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config);

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| EngineError::RuntimeError(format!("failed to install tracing: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&config.level))
}
