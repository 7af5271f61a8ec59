//! Structured logging for the file converter
//!
//! This module provides functionality for:
//! 1. Initializing a console layer and an optional daily-rolling file layer
//! 2. Choosing JSON or line output and the level filter from configuration
//! 3. Logging every watch event, dispatch and conversion with job ID, source,
//!    status and timestamp

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{format::FmtSpan, time::UtcTime},
    prelude::*,
    EnvFilter,
};
use uuid::Uuid;

use crate::config::Logging;

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

const LOG_FILE_PREFIX: &str = "file_converter.log";

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Watch,
    Dispatch,
    Conversion,
    System,
}

impl fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntryType::Watch => write!(f, "watch"),
            LogEntryType::Dispatch => write!(f, "dispatch"),
            LogEntryType::Conversion => write!(f, "conversion"),
            LogEntryType::System => write!(f, "system"),
        }
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Completed,
    Failed,
    Rejected,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Started => write!(f, "started"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes the log file.
pub struct LoggerGuard {
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggerGuard {
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// Install the global subscriber described by `settings`.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(settings: &Logging) -> LoggerResult<LoggerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;
    let json = settings.format == "json";

    let console = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .boxed()
    };

    let (file_layer, guard, log_dir) = if settings.to_file {
        let log_dir = PathBuf::from(&settings.directory);
        std::fs::create_dir_all(&log_dir)?;

        let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        };
        (Some(layer), Some(guard), Some(log_dir))
    } else {
        (None, None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %settings.format,
        log_level = %settings.level,
        to_file = settings.to_file,
        "Logger initialized"
    );

    Ok(LoggerGuard {
        log_dir,
        _guard: guard,
    })
}

/// Log a job state change.
pub fn log_job(job_id: Uuid, source: &Path, status: OperationStatus, details: Option<&str>) {
    let source = source.display();
    match status {
        OperationStatus::Failed => error!(
            entry_type = %LogEntryType::Conversion,
            job_id = %job_id,
            source = %source,
            status = %status,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            "Conversion {} for {}", status, source
        ),
        OperationStatus::Rejected => warn!(
            entry_type = %LogEntryType::Dispatch,
            job_id = %job_id,
            source = %source,
            status = %status,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            "Dispatch {} for {}", status, source
        ),
        _ => info!(
            entry_type = %LogEntryType::Conversion,
            job_id = %job_id,
            source = %source,
            status = %status,
            details = details,
            timestamp = %Utc::now().to_rfc3339(),
            "Conversion {} for {}", status, source
        ),
    }
}

/// Log a watcher event that is not tied to a job.
pub fn log_watch_event(event_type: &str, path: &Path, details: &str) {
    info!(
        entry_type = %LogEntryType::Watch,
        event_type = event_type,
        path = %path.display(),
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "Watch event: {}", event_type
    );
}

/// Log a system event
pub fn log_system_event(event_type: &str, details: &str) {
    info!(
        entry_type = %LogEntryType::System,
        event_type = event_type,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "System event: {}", event_type
    );
}
