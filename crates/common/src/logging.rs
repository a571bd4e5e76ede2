//! Logging utilities for rip-server components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing with human-readable output.
///
/// Uses the RUST_LOG environment variable to control log levels,
/// falling back to `default_level`.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(default_level))
        .try_init();
}

/// Initialize tracing with JSON formatting (one object per line).
pub fn init_json(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter(default_level))
        .try_init();
}

/// Initialize tracing in the format selected by `json`.
pub fn init_with(json: bool, default_level: &str) {
    if json {
        init_json(default_level);
    } else {
        init(default_level);
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
