//! Tracing setup for Shoal
//!
//! Embedders own their subscriber; this is a convenience for binaries and
//! tests that want readable loader logs without wiring one themselves.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Initialize console tracing at the given level.
///
/// `RUST_LOG` overrides `level` when set.
///
/// # Errors
///
/// - `TryInitError` - A global subscriber is already installed
pub fn init_tracing(level: Level) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter);

    tracing_subscriber::registry().with(console_layer).try_init()?;

    tracing::info!(%level, "Tracing initialized");
    Ok(())
}

/// Installs a test-writer subscriber, ignoring an already installed one.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("shoal_core=debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_returns_error() {
        init_test_tracing();
        // A subscriber is installed now, so a second global install must fail
        assert!(init_tracing(Level::INFO).is_err());
    }
}
