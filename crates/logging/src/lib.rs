//! Logging for the sketch orchestrator
//!
//! This crate installs the global `tracing` subscriber: an `EnvFilter` built from
//! `RUST_LOG` or the configured level, pretty or JSON output on stderr, and an
//! optional daily-rolling JSON log file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use common::error::{Error, Result};
use config::ConfigManager;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" | "full" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!("unknown log format '{}'", other))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingOptions {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,

    /// Console format
    pub format: LogFormat,

    /// Log file; rotated daily, the file name is used as prefix
    pub file: Option<PathBuf>,

    /// Include event targets
    pub with_target: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            with_target: true,
        }
    }
}

impl LoggingOptions {
    /// Reads `logging.*` settings
    pub fn from_config(config: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();
        let format = match config.get_string("logging.format") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.format,
        };

        Ok(Self {
            level: config.get_string("logging.level").unwrap_or(defaults.level),
            format,
            file: config.get_path("logging.file").ok(),
            with_target: config.get_bool("logging.with_target").unwrap_or(defaults.with_target),
        })
    }

    /// Builds the filter, letting `RUST_LOG` override the configured level
    pub fn env_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| Error::Config(format!("invalid log level '{}': {}", self.level, e)))
    }
}

/// Keeps the background file writer alive; drop it at shutdown to flush
#[must_use = "dropping the guard stops the file writer"]
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber
pub fn init_logging(options: &LoggingOptions) -> Result<LoggingGuard> {
    let filter = options.env_filter()?;

    let (pretty, json) = match options.format {
        LogFormat::Pretty => (
            Some(
                tracing_fmt::layer()
                    .with_target(options.with_target)
                    .with_writer(std::io::stderr),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_fmt::layer()
                    .json()
                    .with_target(options.with_target)
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    let mut file_guard = None;
    let file_layer = match &options.file {
        Some(path) => {
            let (directory, prefix) = split_log_path(path)?;
            std::fs::create_dir_all(&directory)?;
            let appender = tracing_appender::rolling::daily(&directory, &prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            Some(
                tracing_fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {}", e)))?;

    info!(
        "Logging initialized (level: {}, format: {}, file: {})",
        options.level,
        options.format,
        options
            .file
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    Ok(LoggingGuard { _file_guard: file_guard })
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("log file '{}' has no file name", path.display())))?
        .to_string();

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    Ok((directory, prefix))
}
