//! Logging setup
//!
//! Console output is always on. When a log directory is configured, two
//! daily-rolling files are written as well:
//! - <dir>/fleetd.log - all records as JSON
//! - <dir>/error.log - warnings and errors only

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::infrastructure::config::LoggingConfig;

/// Initialize the global tracing subscriber
///
/// Returns the appender guards, which must be kept alive for the duration of
/// the program so buffered records are flushed on exit.
///
/// # Errors
/// Fails if the log directory cannot be created.
pub fn init_logging(config: &LoggingConfig) -> io::Result<Vec<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_names(true);

    let mut guards = Vec::new();

    let file_layers = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)?;

            let (main_appender, main_guard) = create_appender(dir, "fleetd.log");
            guards.push(main_guard);

            let (error_appender, error_guard) = create_appender(dir, "error.log");
            guards.push(error_guard);

            let main_layer = tracing_subscriber::fmt::layer()
                .with_writer(main_appender)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .json();

            let error_layer = tracing_subscriber::fmt::layer()
                .with_writer(error_appender)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

            Some(main_layer.and_then(error_layer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layers)
        .with(console_layer)
        .init();

    if let Some(dir) = &config.directory {
        tracing::info!(directory = %dir.display(), "file logging enabled");
    }

    Ok(guards)
}

/// Create a rolling file appender
fn create_appender(dir: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    tracing_appender::non_blocking(appender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appender_creates_file_in_directory() {
        let test_dir = Path::new("logs_test_appender");
        if test_dir.exists() {
            fs::remove_dir_all(test_dir).ok();
        }
        fs::create_dir_all(test_dir).unwrap();

        let (_writer, guard) = create_appender(test_dir, "probe.log");
        drop(guard);

        let created = fs::read_dir(test_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with("probe.log"));
        assert!(created);

        fs::remove_dir_all(test_dir).ok();
    }
}
