//! `tracing` bootstrap for the controller process.

use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter, e.g. `info,flotilla=debug`.
pub const LOG_ENV: &str = "FLOTILLA_LOG";

/// Initializes `tracing` with options from `FLOTILLA_LOG`. Defaults to INFO
/// when unset.
///
/// Log output is copied to rotating JSON files when `FLOTILLA_LOG_DIRECTORY`
/// points at a directory.
pub fn initialize_logging(app_name: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let terminal_fmt = tracing_subscriber::fmt::layer();

    let file_appender_directory =
        std::env::var_os(format!("{LOG_ENV}_DIRECTORY")).map(PathBuf::from);
    let file_fmt = file_appender_directory.as_deref().map(|log_dir| {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::HOURLY)
            .filename_prefix(app_name.to_string())
            .filename_suffix("log.json")
            .max_log_files(6)
            .build(log_dir)
            .expect("failed to initialize rolling file appender");
        tracing_subscriber::fmt::layer().json().with_writer(file_appender)
    });

    Registry::default()
        .with(filter)
        .with(terminal_fmt)
        .with(file_fmt)
        .init();

    match file_appender_directory {
        Some(dir) => tracing::info!(directory = %dir.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }
}
