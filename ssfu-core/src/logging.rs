//! Logging setup for the forwarding unit.
//!
//! A thin layer over `tracing-subscriber`: the configured level seeds an
//! `EnvFilter` (a `RUST_LOG` environment variable still wins when present),
//! output is human-readable for development or JSON lines for ingestion,
//! and an optional file sink replaces the terminal.

use anyhow::Context;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber described by `config`.
///
/// Fails when the level is not one tracing knows, the format is neither
/// `pretty` nor `json`, or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(base_filter(&config.level)?);

    let json = match config.format.as_str() {
        "json" => true,
        "pretty" => false,
        other => anyhow::bail!("unrecognised logging.format {other:?}, expected pretty or json"),
    };

    match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            let sink = Arc::new(file);
            if json {
                registry
                    .with(fmt::layer().json().with_target(true).with_writer(sink))
                    .init();
            } else {
                // No colour codes in files.
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(sink))
                    .init();
            }
        }
        None if json => {
            registry
                .with(fmt::layer().json().with_target(true))
                .init();
        }
        None => {
            registry.with(fmt::layer().pretty()).init();
        }
    }

    Ok(())
}

/// Level filter from the configured level, overridable via `RUST_LOG`.
fn base_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level: Level = level.parse().map_err(|_| {
        anyhow::anyhow!("unrecognised logging.level {level:?}, expected trace|debug|info|warn|error")
    })?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string())))
}
