//! Logging setup
//!
//! Structured logging on `tracing` with:
//! - JSON or pretty console output on stderr
//! - Optional log file via a non-blocking appender
//! - EnvFilter overrides through `RUST_LOG`

use std::{io, path::Path};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::GrabError;

/// Initialize the logging system. Returns the appender guard when a log
/// file is configured; the guard must outlive the program.
pub fn init_logging(level: &str, format: &str, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = create_env_filter(level)?;

    let (file_layer, guard) = match file {
        Some(path) => {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or_else(|| "bannergrab.log".as_ref());
            let appender = tracing_appender::rolling::never(parent, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = Registry::default().with(env_filter).with(file_layer);
    match format {
        "json" => {
            let console_layer = fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_target(true);
            registry.with(console_layer).init();
        }
        _ => {
            let console_layer = fmt::layer().with_writer(io::stderr).with_target(false);
            registry.with(console_layer).init();
        }
    }

    Ok(guard)
}

fn create_env_filter(level: &str) -> Result<EnvFilter> {
    let base_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            return Err(GrabError::config(format!("invalid log level: {}", level)).into());
        }
    };

    EnvFilter::builder()
        .with_default_directive(base_level.into())
        .from_env()
        .context("failed to create environment filter")
}
