//! Global subscriber setup: a human-readable stderr layer plus, when
//! `--log-file` is given, a JSON-lines layer at `--log-level` (the
//! "Event log" of spec.md §6).

use std::fs::OpenOptions;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use eavesarp_core::config::{Config, LogLevel};

use crate::error::{Error, Result};

pub fn init(config: &Config) -> Result<()> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str()));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(true);

    let registry = tracing_subscriber::registry().with(stderr_layer.with_filter(stderr_filter));

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(Error::Io)?;
            let file_filter = EnvFilter::new(config.log_level.as_filter_str());
            let file_layer = fmt::layer().json().with_writer(file).with_filter(file_filter);
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }

    Ok(())
}

#[allow(dead_code)]
fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::new(level.as_filter_str())
}
