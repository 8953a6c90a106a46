//! Tracing subscriber setup.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let default_directive = format!(
        "storefront_reconciler={},tower_http=debug",
        config.level.to_lowercase()
    );
    let filter_directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let result = match config.format {
        LogFormat::Json => fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init(),
        LogFormat::Plain => fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}
