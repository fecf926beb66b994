//! Process-wide logging sink lifecycle: `init -> set level -> accept
//! messages -> drain-and-close`. Installed once at startup; every other
//! crate logs through `tracing` events rather than holding a logger
//! handle of its own.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Where log lines go. `File` is opened in append mode and never rotated;
/// operators wanting rotation should pipe stdout through an external tool.
pub enum LogDestination {
    Stdout,
    Stderr,
    File(std::path::PathBuf),
}

pub fn init(level: &str, destination: LogDestination) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(level)
        .map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match destination {
        LogDestination::Stdout => builder.with_writer(std::io::stdout).try_init(),
        LogDestination::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;
            builder.with_writer(std::sync::Mutex::new(file)).try_init()
        }
    };

    result.map_err(|_| LoggingError::AlreadyInitialized)
}

pub fn parse_level(level: &str) -> Result<tracing::Level, LoggingError> {
    tracing::Level::from_str(level).map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}
