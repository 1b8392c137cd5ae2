//! Test harness helpers.

use tracing_subscriber::EnvFilter;

/// Set up test logging with the given filter.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// Set up test logging honoring `RUST_LOG`, defaulting to `warn`.
pub fn init_test_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_owned());
    setup_test_logging(&filter);
}
