//! Logger setup.
//!
//! The crate only emits through the `log` facade; hosts that already
//! install a logger need none of this.

/// Install `env_logger` with an `info` default, overridable by `RUST_LOG`.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Logger for tests: captured by the test harness, safe to call from every
/// test.
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
