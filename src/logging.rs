//! Tracing subscriber bootstrap.
//!
//! Call one of these once at startup, before constructing an engine. The
//! `RUST_LOG` environment variable controls filtering, e.g.
//! `RUST_LOG=squall=debug`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with sensible defaults (`info` unless `RUST_LOG` is
/// set). Panics if a global subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging at a specific level, still overridable by `RUST_LOG`.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
