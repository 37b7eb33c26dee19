//! Shared helpers for integration tests

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once; `RUST_LOG` overrides the default level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
