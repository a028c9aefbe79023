//! Tracing setup for the CLI and the daemon.
//!
//! The daemon logs to systemd's journal when it can. The CLI always logs to
//! a rolling file under the data directory so its stdout stays clean.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `PICSYNC_LOG` is unset. The HTTP client is chatty at
/// info level, so only its warnings get through.
const DEFAULT_FILTER: &str = "info,ureq=warn,rustls=warn";

/// Rotated log files kept on disk.
const MAX_LOG_FILES: usize = 7;

/// Where log output ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Journald,
    File(PathBuf),
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picsync")
        .join("logs")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("PICSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber.
///
/// Log level is controlled via `PICSYNC_LOG` using `EnvFilter` directives,
/// e.g. `PICSYNC_LOG=picsync::sync=debug`.
///
/// With `prefer_journald` set (the daemon), journald is tried first on
/// Linux. Otherwise, or when the journal is unreachable, logs go to a
/// daily file in `log_dir` (default: [`default_log_dir`]).
pub fn init(log_dir: Option<PathBuf>, prefer_journald: bool) -> Result<LogTarget> {
    #[cfg(target_os = "linux")]
    {
        if prefer_journald {
            if let Ok(journald_layer) = tracing_journald::layer() {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(journald_layer.with_syslog_identifier("picsync".to_string()))
                    .try_init()?;

                tracing::info!("Logging to journald");
                return Ok(LogTarget::Journald);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = prefer_journald;

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("picsync")
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(&log_dir)
        .context("Failed to open log file")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer stops flushing once its guard is dropped
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;

    tracing::info!("Logging to {:?}", log_dir);
    Ok(LogTarget::File(log_dir))
}
