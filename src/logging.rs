//! Tracing initialization.
//!
//! Structured, async-aware logging for the station. Uses `tracing` and
//! `tracing-subscriber` with environment-based filtering: `RUST_LOG` wins
//! when set, otherwise the configured level applies.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{StationError, StationResult};

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed with colors, for development.
    Pretty,
    /// Single-line without decoration, for production.
    Compact,
    /// JSON, for log aggregation.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(StationError::Configuration(format!(
                "unknown log format '{}' (expected pretty, compact or json)",
                other
            ))),
        }
    }
}

/// Install the global subscriber from application settings.
///
/// Safe to call once per process; a second call reports a configuration
/// error instead of panicking.
pub fn init(config: &ApplicationConfig) -> StationResult<()> {
    let format: LogFormat = config.log_format.parse()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().with_ansi(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| StationError::Configuration(format!("tracing init failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("fancy".parse::<LogFormat>().is_err());
    }
}
