//! Logging initialization.
//!
//! The log level is controlled by the `RUST_LOG` environment variable,
//! defaulting to `info`. Call once at startup, before building servers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level (`trace`, `debug`,
/// `info`, `warn`, `error`). `RUST_LOG` still takes precedence when set.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
