use crate::config::Settings;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber.
/// RUST_LOG wins over `logging.level`; `logging.json = true` switches to JSON lines.
pub fn init(settings: &Settings) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(settings)));

    let json = settings.logging.json.unwrap_or(false);
    let registry = tracing_subscriber::registry().with(env_filter);
    // try_init: tests and embedders may already have a subscriber installed
    let res = if json {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn filter_directive(settings: &Settings) -> String {
    settings
        .logging
        .level
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}
