//! Tracing setup
//!
//! Installs a global `tracing` subscriber writing either compact console
//! output or JSON lines.

use crate::{ObservabilityError, Result};
use dagrun_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub service_version: String,
    /// Default filter directives, used when `RUST_LOG` is unset
    pub log_level: String,
    pub json_logs: bool,
    /// Log span close events, with their timings
    pub span_events: bool,
    pub colored_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "dagrun".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            span_events: false,
            colored_output: true,
        }
    }
}

impl TracingConfig {
    pub fn production() -> Self {
        Self {
            json_logs: true,
            colored_output: false,
            ..Default::default()
        }
    }

    pub fn with_service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    pub fn with_span_events(mut self) -> Self {
        self.span_events = true;
        self
    }
}

impl From<&TelemetryConfig> for TracingConfig {
    fn from(telemetry: &TelemetryConfig) -> Self {
        Self {
            service_name: telemetry.service_name.clone(),
            log_level: telemetry.log_level.clone(),
            json_logs: telemetry.json_logs,
            colored_output: !telemetry.json_logs,
            ..Default::default()
        }
    }
}

/// Parse filter directives such as `info` or `dagrun_orchestrator=debug,warn`
pub fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| {
        ObservabilityError::Configuration(format!("invalid log filter {directives:?}: {e}"))
    })
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.log_level)?,
    };

    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_events(span_events);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    } else {
        let fmt_layer = fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(config.colored_output)
            .with_span_events(span_events);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        json = config.json_logs,
        "Tracing initialized"
    );

    Ok(())
}

/// Install the global subscriber from the telemetry section of the
/// orchestrator configuration
pub fn init_from_telemetry(telemetry: &TelemetryConfig) -> Result<()> {
    init_tracing(&TracingConfig::from(telemetry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();

        assert_eq!(config.service_name, "dagrun");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
        assert!(config.colored_output);
    }

    #[test]
    fn test_production_config() {
        let config = TracingConfig::production().with_service_name("dagrun-api");

        assert!(config.json_logs);
        assert!(!config.colored_output);
        assert_eq!(config.service_name, "dagrun-api");
    }

    #[test]
    fn test_from_telemetry() {
        let telemetry = TelemetryConfig {
            log_level: "debug".to_string(),
            json_logs: true,
            service_name: "scheduler".to_string(),
        };
        let config = TracingConfig::from(&telemetry);

        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert!(!config.colored_output);
        assert_eq!(config.service_name, "scheduler");
    }

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("dagrun_orchestrator=debug,warn").is_ok());

        let err = parse_filter("dagrun_orchestrator=loud").unwrap_err();
        assert!(matches!(err, ObservabilityError::Configuration(_)));
    }

    #[test]
    fn test_init_only_once() {
        let config = TracingConfig::default().with_log_level("warn").with_span_events();

        // Another subscriber may already be installed by the harness
        let _ = init_tracing(&config);
        let err = init_tracing(&config).unwrap_err();
        assert!(matches!(err, ObservabilityError::TracingInit(_)));
    }
}
