use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Console tracing with env-filter (`RUST_LOG`, default `info`). Safe to
/// call more than once; later calls are no-ops so an embedded start
/// inside an already-instrumented host keeps the host's subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .try_init();
}
