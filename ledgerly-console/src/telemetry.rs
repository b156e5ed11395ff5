//! Tracing subscriber initialization.

use ledgerly_core::ConfigError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn from_env_value(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("LEDGERLY_SERVICE_NAME")
                .unwrap_or_else(|_| "ledgerly-console".to_string()),
            environment: std::env::var("LEDGERLY_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            log_format: std::env::var("LEDGERLY_LOG_FORMAT")
                .map(|s| LogFormat::from_env_value(&s))
                .unwrap_or_default(),
            default_filter: "ledgerly=debug,info".to_string(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails with
/// [`ConfigError::AlreadyInitialized`].
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|_| ConfigError::AlreadyInitialized {
        component: "tracing subscriber".to_string(),
    })?;

    tracing::info!(
        service_name = config.service_name,
        environment = config.environment,
        format = ?config.log_format,
        "Telemetry initialized"
    );
    Ok(())
}
