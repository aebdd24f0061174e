//! Shared test setup. Not a test module itself (no `#[test]`s), so it is `include!`d/`mod`-ed by
//! each integration test binary that wants it.

/// Installs a `tracing_subscriber` so that `tracing::debug!`/etc. emitted by the run-loop surface
/// in `cargo test -- --nocapture` output. Safe to call from every test: only the first call in a
/// given test binary actually installs anything, later ones are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
