//! Logging and tracing initialization.
//!
//! Call one of these once at startup, before `serve`. The log level is
//! controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Show request traces
//! RUST_LOG=debug cargo run
//!
//! # Fine-grained control
//! RUST_LOG=felis=debug,felis::cache=trace cargo run
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with sensible defaults.
///
/// The level comes from `RUST_LOG`, defaulting to `info`.
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Call it once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging with an explicit level instead of `RUST_LOG`.
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Call it once.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize JSON-formatted logging for log aggregation systems.
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Call it once.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
