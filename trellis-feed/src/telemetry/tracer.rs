//! Tracing Subscriber Initialization

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trellis_core::config::env_or;
use trellis_core::{TrellisError, TrellisResult};

const DEFAULT_FILTER: &str = "trellis_feed=debug,trellis_storage=info,trellis_events=info,info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    pub log_format: LogFormat,
    /// Used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "trellis-feed".to_string(),
            log_format: LogFormat::Json,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// `TRELLIS_SERVICE_NAME`, `TRELLIS_LOG_FORMAT` (`json` or `pretty`).
    pub fn from_env() -> Self {
        let format = env_or("TRELLIS_LOG_FORMAT", "json".to_string());
        Self {
            service_name: env_or("TRELLIS_SERVICE_NAME", "trellis-feed".to_string()),
            log_format: parse_format(&format),
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

fn parse_format(value: &str) -> LogFormat {
    match value.trim().to_ascii_lowercase().as_str() {
        "pretty" | "text" => LogFormat::Pretty,
        _ => LogFormat::Json,
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup before any tracing occurs. `RUST_LOG` overrides the
/// configured default filter.
pub fn init_tracing(config: &TelemetryConfig) -> TrellisResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let result = match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };
    result.map_err(|e| TrellisError::Unavailable(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = config.service_name,
        format = ?config.log_format,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(parse_format("pretty"), LogFormat::Pretty);
        assert_eq!(parse_format(" TEXT "), LogFormat::Pretty);
        assert_eq!(parse_format("json"), LogFormat::Json);
        assert_eq!(parse_format("garbage"), LogFormat::Json);
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "trellis-feed");
        assert!(config.default_filter.starts_with("trellis_feed=debug"));
    }
}
