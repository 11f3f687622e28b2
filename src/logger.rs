//! Logging setup for embedding binaries and tests.

/// Install the global tracing subscriber, filtered by `RUST_LOG`. Safe to
/// call more than once; later calls are no-ops.
pub fn init() {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(std::env::var_os("DISABLE_COLOR").is_none())
        .try_init()
        .ok();
}
