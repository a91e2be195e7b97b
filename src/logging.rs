use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;

/// Install the global JSON subscriber. `RUST_LOG` wins over the configured
/// level. Safe to call more than once; later calls are no-ops.
pub fn init_subscriber(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let formatter = fmt::layer().json();

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(formatter)
        .try_init()
    {
        eprintln!("tracing subscriber already installed: {err}");
    }
}
