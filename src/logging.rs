//! Tracing subscriber for the `chatlink` binary
//!
//! Console output always goes to stderr; stdout is reserved for the paced
//! execution content. `logging.level` is an `EnvFilter` directive and is
//! ignored when `RUST_LOG` is set. With `logging.file_path` the same events
//! are appended to that file, never colored.

use crate::config::LoggingConfig;
use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber described by `config`.
///
/// In JSON mode each line also carries the current span and its parents.
/// Call once, before the client starts.
///
/// # Errors
///
/// A directive that does not parse, a log file that cannot be opened for
/// appending, or a subscriber that is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(env_filter);
    let log_file = config.file_path.as_deref().map(open_log_file).transpose()?;

    if config.json_format {
        let console_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);
        let file_layer = log_file.map(|file| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(file)
        });
        registry.with(console_layer).with(file_layer).try_init()?;
    } else {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        let file_layer = log_file.map(|file| {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file)
        });
        registry.with(console_layer).with(file_layer).try_init()?;
    }

    Ok(())
}

fn open_log_file(path: &Path) -> Result<Arc<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?)
}
