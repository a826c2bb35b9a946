//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to
//! foreman's own targets. Output goes to stderr, human-readable or JSON, and
//! optionally to a daily-rotated JSON file under `.foreman/logs`.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

pub const LOG_FILE_PREFIX: &str = "foreman.log";

/// Build the filter from `RUST_LOG`, falling back to `default_directive`.
pub fn env_filter(default_directive: &str) -> Result<EnvFilter> {
    match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => {
            EnvFilter::try_new(&value).with_context(|| format!("Invalid RUST_LOG directive: {value}"))
        }
        _ => EnvFilter::try_new(default_directive)
            .with_context(|| format!("Invalid log directive: {default_directive}")),
    }
}

/// Install the global subscriber for `config`.
///
/// The returned guard flushes the file writer; keep it alive until exit.
pub fn init(config: &Config) -> Result<Option<WorkerGuard>> {
    let log_dir = config.toml.logging.file.then(|| config.log_dir());
    init_with(&config.log_directive(), config.log_json(), log_dir.as_deref())
}

pub fn init_with(default_directive: &str, json: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(default_directive)?;

    let stderr_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).compact().boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
