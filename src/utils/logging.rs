//! Tracing subscriber setup
//!
//! Diagnostics always go to stderr so stdout stays clean for question
//! replies. An optional log file receives the same events without color.

use crate::core::context::Verbosity;
use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter directive for a verbosity level
pub fn filter_for(verbosity: Verbosity) -> &'static str {
    match verbosity.level() {
        0 => "warn",
        1 => "info",
        2 | 3 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity` when set.
///
/// The returned guard must be held until exit or buffered file output is
/// lost.
pub fn init_tracing(
    verbosity: Verbosity,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for(verbosity)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity.at_least(Verbosity::GEEKY));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Unable to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Tracing already initialized")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_levels() {
        assert_eq!(filter_for(Verbosity::SILENT), "warn");
        assert_eq!(filter_for(Verbosity::new(1)), "info");
        assert_eq!(filter_for(Verbosity::new(3)), "debug");
        assert_eq!(filter_for(Verbosity::MAX), "trace");
    }
}
