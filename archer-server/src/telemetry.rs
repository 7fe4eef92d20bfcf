use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` wins over `debug`.
pub fn init_tracing(debug: bool) {
    let fallback = if debug {
        "debug,hyper=info,sqlx=info,tower_http=debug"
    } else {
        "info,sqlx=warn,tower_http=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
