//! Process bootstrap helpers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "EXPORT_LOG";

/// Initialize tracing with the EXPORT_LOG environment variable.
///
/// Defaults to "info" level if EXPORT_LOG is not set. With `json` set the
/// output is one JSON object per line.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
