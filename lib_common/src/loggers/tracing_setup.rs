//! # Process Logging
//!
//! One subscriber for the whole process: an ANSI console layer plus a JSON
//! layer written to a daily rolling file through a non-blocking worker. Library
//! code logs through the `log` facade; `tracing-subscriber` bridges those
//! records into the same pipeline when it is installed.

use std::io;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Directory for the rolling JSON log file. Created if missing.
    pub log_dir: PathBuf,
    /// File name prefix; the date is appended by the appender.
    pub file_prefix: String,
    /// Default filter directive, used when `RUST_LOG` is not set.
    pub level: String,
    /// Colored console output.
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            file_prefix: "rtk".to_string(),
            level: "info".to_string(),
            ansi: true,
        }
    }
}

/// Installs the global subscriber.
///
/// The returned guard owns the file writer thread; keep it alive until the
/// process exits or buffered lines are lost.
pub fn init_tracing(settings: &LogSettings) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.log_dir)?;

    let file_appender = rolling::daily(&settings.log_dir, &settings.file_prefix);
    let (file_writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(settings.ansi);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer).json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(io::Error::other)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!(level = %settings.level, dir = %settings.log_dir.display(), "Logging initialized");
    Ok(guard)
}
