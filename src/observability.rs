//! Tracing initialization with configurable logging formats.
//!
//! Every process entry point calls [`init_tracing`] exactly once before any
//! other work. Log filtering follows `RUST_LOG` when set, falling back to the
//! configured level.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ObservabilityConfig};

/// Initialize the tracing subscriber with the given configuration.
///
/// This sets up console logging with a configurable format (pretty, compact,
/// JSON) and environment-based log filtering.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    match config.log_format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .pretty()
                .with_target(true)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        }
    }
}
