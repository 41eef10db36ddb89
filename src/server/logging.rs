//! Logging initialization and configuration.

use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use super::config::{LogFormat, LoggingConfig};

/// Where log lines go.
enum Output {
    Stdout,
    Stderr,
    File(std::fs::File),
}

impl Output {
    fn open(target: &str) -> Result<Self, LoggingError> {
        match target {
            "stdout" => Ok(Output::Stdout),
            "stderr" => Ok(Output::Stderr),
            path => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Output::File)
                .map_err(|e| LoggingError::FileOpen(path.to_string(), e)),
        }
    }

    fn is_terminal(&self) -> bool {
        match self {
            Output::Stdout => io::stdout().is_terminal(),
            Output::Stderr => io::stderr().is_terminal(),
            Output::File(_) => false,
        }
    }

    fn into_writer(self) -> fmt::writer::BoxMakeWriter {
        match self {
            Output::Stdout => fmt::writer::BoxMakeWriter::new(io::stdout),
            Output::Stderr => fmt::writer::BoxMakeWriter::new(io::stderr),
            Output::File(file) => fmt::writer::BoxMakeWriter::new(std::sync::Mutex::new(file)),
        }
    }
}

/// Initialize the tracing subscriber based on configuration.
///
/// `level_override` (from the command line) replaces the configured filter.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<(), LoggingError> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter(e.to_string()))?;
    let output = Output::open(&config.output)?;
    let ansi = config.color && output.is_terminal();
    let writer = output.into_writer();

    match config.format {
        LogFormat::Text => {
            let layer = fmt::layer()
                .with_ansi(ansi)
                .with_target(config.target)
                .with_span_events(FmtSpan::NONE)
                .with_writer(writer);
            if config.timestamps {
                tracing_subscriber::registry().with(filter).with(layer).try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(config.target)
                .with_span_events(FmtSpan::NONE)
                .with_writer(writer);
            if config.timestamps {
                tracing_subscriber::registry().with(filter).with(layer).try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.without_time())
                    .try_init()
            }
        }
    }
    .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

/// Errors that can occur during logging initialization.
#[derive(Debug)]
pub enum LoggingError {
    /// Invalid log filter string.
    InvalidFilter(String),
    /// Failed to open log file.
    FileOpen(String, io::Error),
    /// A global subscriber was already installed.
    AlreadyInitialized(String),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::InvalidFilter(msg) => write!(f, "Invalid log filter: {}", msg),
            LoggingError::FileOpen(path, e) => {
                write!(f, "Failed to open log file '{}': {}", path, e)
            }
            LoggingError::AlreadyInitialized(msg) => write!(f, "Logging already initialized: {}", msg),
        }
    }
}

impl std::error::Error for LoggingError {}
