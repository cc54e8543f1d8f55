//! Structured logging initialization.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary. The RUST_LOG environment variable takes precedence over the
//! configured level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the global tracing subscriber.
///
/// # Example
///
/// ```ignore
/// use rpc_core::config::LoggingConfig;
/// use rpc_core::logging;
///
/// logging::init(&LoggingConfig::default());
/// tracing::info!("echo starting");
/// ```
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let layer = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    // each format/timestamp combination is a distinct layer type
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_ansi(true))
                .init();
        }
        (LogFormat::Pretty, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_ansi(true).without_time())
                .init();
        }
        (LogFormat::Json, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json())
                .init();
        }
        (LogFormat::Json, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json().without_time())
                .init();
        }
        (LogFormat::Compact, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact().with_ansi(true))
                .init();
        }
        (LogFormat::Compact, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.compact().with_ansi(true).without_time())
                .init();
        }
    }
}
