//! Initialisation du logging
//!
//! Les journaux partent sur stderr : stdout porte le protocole du résolveur.

use pmoconfig::Config;
use tracing::Level;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn string_to_level(level: &str) -> Option<Level> {
    match level.trim().to_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

/// `RUST_LOG` prime sur `host.logger.min_level`
fn filter(config: &Config) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = config
        .get_log_min_level()
        .ok()
        .and_then(|l| string_to_level(&l))
        .unwrap_or(Level::INFO);
    EnvFilter::new(level.as_str())
}

pub fn init_logging(config: &Config) {
    let registry = tracing_subscriber::registry().with(filter(config));

    if config.get_log_enable_console() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry.init();
    }
}
