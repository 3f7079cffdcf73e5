//! Test logging.
//!
//! Output goes through the test writer, so it only shows for failing tests.
//! `RUST_LOG=strand_bus=trace cargo test` is the usual way to watch routing.

use tracing_subscriber::EnvFilter;

/// Install a test subscriber with `filter`.
///
/// Every test may call it; the first call in the process wins.
pub fn setup_test_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}

/// [`setup_test_logging`] with `RUST_LOG`, falling back to `warn`.
pub fn setup_test_logging_default() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_owned());
    setup_test_logging(&filter);
}
