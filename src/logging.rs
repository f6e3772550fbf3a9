//! Structured logging setup.
//!
//! Built on `tracing` and `tracing-subscriber`: an `EnvFilter` honors
//! `RUST_LOG` when set and otherwise follows the configured level, and the
//! output format (pretty, compact, JSON) comes from the `debug` section of
//! the settings. Initialization is idempotent so tests can call it freely.

use crate::config::DebugSettings;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initialize the global subscriber from settings.
pub fn init(settings: &DebugSettings) -> Result<(), String> {
    let level = parse_level(&settings.log_level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let result = match settings.log_format.as_str() {
        "json" => {
            let layer = fmt::layer()
                .json()
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        "compact" => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        _ => {
            let layer = fmt::layer()
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    match result {
        Ok(()) => Ok(()),
        // Already initialized, e.g. by an earlier test; keep the existing
        // subscriber.
        Err(err)
            if err
                .to_string()
                .contains("a global default trace dispatcher has already been set") =>
        {
            Ok(())
        }
        Err(err) => Err(format!("failed to initialize logging: {err}")),
    }
}

pub fn parse_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "invalid log level '{level}', expected one of: trace, debug, info, warn, error"
        )),
    }
}
