//! Tracing subscriber setup.
//!
//! Builds one `fmt` layer in the configured format behind an [`EnvFilter`].
//! `RUST_LOG` wins over the configured level when set.
//!
//! # Example
//! ```no_run
//! use labctl::{config::Config, logging};
//!
//! let config = Config::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("started");
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::config::{Config, LogFormat, LoggingConfig};
use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging from the `[logging]` section.
pub fn init_from_config(config: &Config) -> Result<()> {
    init(&config.logging)
}

/// Install the global subscriber.
///
/// Calling this again after a subscriber is installed is a no-op, so tests
/// and embedding applications may call it freely.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_ansi(config.ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("global default trace dispatcher has already been set") => {
            Ok(())
        }
        Err(e) => Err(anyhow!("failed to initialize tracing: {}", e)),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow!(
            "invalid log level '{}', must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
