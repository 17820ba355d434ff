//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if std::env::var_os("DEBUG").is_some() {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Installs the global fmt subscriber. The filter comes from `RUST_LOG`,
/// else `debug` when `DEBUG` is set, else `info`.
///
/// Does nothing if a global subscriber is already installed.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_target(false)
        .try_init();
}

/// Subscriber for tests: output goes through the test harness capture.
/// Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_test_writer()
        .try_init();
}

/// True when `DEBUG` is set, which also turns on child process output.
pub fn debug_enabled() -> bool {
    std::env::var_os("DEBUG").is_some()
}
