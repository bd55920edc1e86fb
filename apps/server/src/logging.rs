//! Logging setup
//!
//! Console output is always on; a rolling file sink is added when
//! `logging.file_enabled` is set. `RUST_LOG` overrides the configured level.

use crate::config::LoggingConfig;
use anyhow::Context;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

fn rotation(name: &str) -> anyhow::Result<rolling::Rotation> {
    match name.to_ascii_lowercase().as_str() {
        "daily" => Ok(rolling::Rotation::DAILY),
        "hourly" => Ok(rolling::Rotation::HOURLY),
        "minutely" => Ok(rolling::Rotation::MINUTELY),
        "never" => Ok(rolling::Rotation::NEVER),
        other => anyhow::bail!("unknown log rotation '{other}'"),
    }
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).context("Invalid RUST_LOG directives")
        }
        _ => EnvFilter::try_new(format!("{level},tower_http=info"))
            .with_context(|| format!("Invalid log level '{level}'")),
    }
}

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<TelemetryGuard> {
    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, file_guard) = if config.file_enabled {
        std::fs::create_dir_all(&config.file_directory).with_context(|| {
            format!("Failed to create log directory {}", config.file_directory)
        })?;
        let appender = rolling::RollingFileAppender::builder()
            .rotation(rotation(&config.file_rotation)?)
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(&config.file_directory)
            .context("Failed to create rolling log file")?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(writer)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter(&config.level)?)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::debug!(
        level = %config.level,
        json = config.json,
        file = config.file_enabled,
        "Logging initialized"
    );

    Ok(TelemetryGuard { _file: file_guard })
}

/// Flush hook for process exit. The file writer flushes when its guard drops.
pub fn shutdown_telemetry() {
    tracing::debug!("Logging shut down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_names_are_case_insensitive() {
        assert!(rotation("Daily").is_ok());
        assert!(rotation("never").is_ok());
        assert!(rotation("weekly").is_err());
    }
}
