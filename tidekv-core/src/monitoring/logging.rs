//! Structured logging with tracing

use crate::config::{LogFormat, LoggingSettings};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails if a subscriber is
/// already installed or the log file cannot be opened.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .with_context(|| format!("Invalid log level: {}", settings.level))?;

    let layer = match &settings.file {
        None => match settings.format {
            LogFormat::Text => fmt::layer().with_target(true).compact().boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .boxed(),
        },
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let writer = Mutex::new(file);
            match settings.format {
                LogFormat::Text => fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(writer)
                    .boxed(),
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(writer)
                    .boxed(),
            }
        }
    };

    Registry::default()
        .with(layer)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        "Logging initialized: level={}, format={:?}, file={:?}",
        settings.level,
        settings.format,
        settings.file
    );
    Ok(())
}
