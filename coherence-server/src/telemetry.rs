//! Tracing Subscriber Initialization
//!
//! Installs a `tracing-subscriber` fmt layer filtered by `EnvFilter`, with
//! plain or JSON output.

use coherence_core::{CoherenceResult, ConfigError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `coherence_server=debug,info`
    pub log_filter: String,
    pub format: LogFormat,
    /// Service name attached to the startup event
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Text,
            service_name: "coherence-server".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create TelemetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `COHERENCE_LOG`: filter directives (default: "info")
    /// - `COHERENCE_LOG_FORMAT`: "json" for JSON lines, anything else for text
    /// - `COHERENCE_SERVICE_NAME`: service name (default: "coherence-server")
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_filter: std::env::var("COHERENCE_LOG").unwrap_or(defaults.log_filter),
            format: match std::env::var("COHERENCE_LOG_FORMAT") {
                Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            service_name: std::env::var("COHERENCE_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        EnvFilter::try_new(&self.log_filter).map_err(|e| ConfigError::InvalidValue {
            field: "COHERENCE_LOG".to_string(),
            value: self.log_filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_tracing(config: &TelemetryConfig) -> CoherenceResult<()> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "tracing subscriber".to_string(),
        value: config.service_name.clone(),
        reason: e.to_string(),
    })?;

    tracing::info!(
        service_name = config.service_name,
        log_filter = config.log_filter,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}
