//! Logging initialization
//!
//! `RUST_LOG` always wins. Without it, the level follows a `-v` style counter.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber is already installed
    #[error("failed to install log subscriber: {0}")]
    Init(String),
}

/// Level for a verbosity counter: 0 warn, 1 info, 2 debug, 3+ trace
pub fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn filter_for(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_from_verbosity(verbosity).as_str()))
}

/// Install the global subscriber
pub fn init_logging(verbosity: u8, format: LogFormat) -> Result<(), TelemetryError> {
    let filter = filter_for(verbosity);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), Level::WARN);
        assert_eq!(level_from_verbosity(1), Level::INFO);
        assert_eq!(level_from_verbosity(2), Level::DEBUG);
        assert_eq!(level_from_verbosity(3), Level::TRACE);
        assert_eq!(level_from_verbosity(200), Level::TRACE);
    }

    #[test]
    fn second_init_is_an_error() {
        let _ = init_logging(0, LogFormat::Text);
        assert!(matches!(
            init_logging(1, LogFormat::Json),
            Err(TelemetryError::Init(_))
        ));
    }
}
