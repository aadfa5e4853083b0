use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Falls back to `info` when `filter` does not
/// parse, and is a no-op if a subscriber is already installed.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let _ = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
