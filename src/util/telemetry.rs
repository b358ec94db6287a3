//! Telemetry helpers for structured logging.

/// Install a default `RUST_LOG`-driven fmt subscriber unless the application
/// already set one.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
