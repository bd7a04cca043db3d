//! Logging setup for the battery monitor.
//!
//! tracing is configured with JSON output to both stderr and a daily
//! rotating log file at ~/.local/share/fuhlen-monitor/monitor.*.log. When the
//! file cannot be opened, stderr is the only output.

use crate::error::LoggingError;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Directory name under the user's local data directory
const LOG_DIR_NAME: &str = "fuhlen-monitor";
/// Log file prefix; the appender adds the date and suffix
const LOG_FILE_PREFIX: &str = "monitor";
/// Maximum number of log files to retain
const MAX_LOG_FILES: usize = 3;
/// Filter used when `RUST_LOG` is unset or invalid
const DEFAULT_FILTER: &str = "info";

/// Initialize the logging system with both stderr and file output.
///
/// Never fails: when the log directory cannot be used, logging continues on
/// stderr alone and the reason is logged there. The returned guard flushes
/// the background writers on drop and must be held for the lifetime of the
/// process.
pub fn init_logging() -> LogGuard {
    let file = log_directory().and_then(|dir| open_log_file(&dir));

    let (file_layer, file_guard, file_error) = match file {
        Ok(appender) => {
            let (non_blocking_file, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_current_span(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(non_blocking_file);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    let (non_blocking_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_current_span(true)
        .with_writer(non_blocking_stderr);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    if let Some(e) = file_error {
        warn!("File logging unavailable, logging to stderr only: {}", e);
    }

    LogGuard {
        _file_guard: file_guard,
        _stderr_guard: stderr_guard,
    }
}

/// Create `log_dir` if needed and open the rotating appender in it.
fn open_log_file(log_dir: &Path) -> Result<RollingFileAppender, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|e| LoggingError::DirectoryCreationFailed {
        path: log_dir.display().to_string(),
        source: e,
    })?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)
        .map_err(|e| LoggingError::AppenderCreationFailed(e.to_string()))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// ~/.local/share/fuhlen-monitor, or the platform equivalent.
fn log_directory() -> Result<PathBuf, LoggingError> {
    dirs::data_local_dir()
        .map(|dir| dir.join(LOG_DIR_NAME))
        .ok_or(LoggingError::DataDirectoryNotFound)
}

/// Guard that keeps the non-blocking writers alive.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    _stderr_guard: tracing_appender::non_blocking::WorkerGuard,
}
