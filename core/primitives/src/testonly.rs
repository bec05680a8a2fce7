//! Helpers for tests across the workspace.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a tracing subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call installs.
pub fn init_test_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
