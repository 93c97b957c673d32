//! Logger setup.
//!
//! The threshold comes from the `LOGGER_LEVEL` environment variable
//! (`TRACE`, `INFO`, `WARN`, `ERROR`, `DISABLE`); unset or unrecognized
//! values keep everything (`TRACE`), matching the behavior the serving side
//! has always had. `run --log[=PATH]` redirects output to a file, with ANSI
//! colors turned off.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::level_filters::LevelFilter;

use crate::error::VmmError;

/// Maps `LOGGER_LEVEL` to a filter. Unknown values fall back to `TRACE`.
fn level_from_env() -> LevelFilter {
    match std::env::var("LOGGER_LEVEL").as_deref() {
        Ok("INFO") => LevelFilter::INFO,
        Ok("WARN") => LevelFilter::WARN,
        Ok("ERROR") => LevelFilter::ERROR,
        Ok("DISABLE") => LevelFilter::OFF,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the global tracing subscriber.
///
/// `log_file`: `None` logs to stdout; `Some(path)` appends to `path`.
/// Must be called once, before any VM work starts.
pub fn init(log_file: Option<&Path>) -> Result<(), VmmError> {
    let level = level_from_env();

    match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                VmmError::Args(format!("cannot open log file {}: {e}", path.display()))
            })?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }

    Ok(())
}
