//! Subscriber bootstrap for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
pub fn init() {
    let _ = try_init();
}

pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter(env_filter()).try_init()
}

/// Like [`init`], but writes through the test harness's captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter()).with_test_writer().try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
