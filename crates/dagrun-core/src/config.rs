//! Orchestrator configuration loaded from defaults, an optional file and
//! `DAGRUN__*` environment overrides.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main orchestrator configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl OrchestratorConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("DAGRUN")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("DAGRUN")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    builder
        .set_default("polling.start_poll_interval_ms", default_start_poll_interval_ms())?
        .set_default("polling.start_timeout_ms", default_start_timeout_ms())?
        .set_default("polling.enqueue_timeout_ms", default_enqueue_timeout_ms())?
        .set_default("polling.sync_initial_interval_ms", default_sync_initial_interval_ms())?
        .set_default("polling.sync_backoff_multiplier", default_sync_backoff_multiplier())?
        .set_default("polling.sync_max_interval_ms", default_sync_max_interval_ms())?
        .set_default("telemetry.log_level", default_log_level())?
        .set_default("telemetry.json_logs", false)?
        .set_default("telemetry.service_name", default_service_name())
}

/// Poll intervals and bounds used while observing out-of-process runs
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_start_poll_interval_ms")]
    pub start_poll_interval_ms: u64,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_sync_initial_interval_ms")]
    pub sync_initial_interval_ms: u64,
    #[serde(default = "default_sync_backoff_multiplier")]
    pub sync_backoff_multiplier: f64,
    #[serde(default = "default_sync_max_interval_ms")]
    pub sync_max_interval_ms: u64,
}

impl PollingConfig {
    pub fn new() -> Self {
        Self {
            start_poll_interval_ms: default_start_poll_interval_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            sync_initial_interval_ms: default_sync_initial_interval_ms(),
            sync_backoff_multiplier: default_sync_backoff_multiplier(),
            sync_max_interval_ms: default_sync_max_interval_ms(),
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_ms = millis(timeout);
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout_ms = millis(timeout);
        self
    }

    pub fn with_sync_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.sync_initial_interval_ms = millis(initial);
        self.sync_backoff_multiplier = multiplier;
        self.sync_max_interval_ms = millis(max);
        self
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn sync_initial_interval(&self) -> Duration {
        Duration::from_millis(self.sync_initial_interval_ms)
    }

    pub fn sync_max_interval(&self) -> Duration {
        Duration::from_millis(self.sync_max_interval_ms)
    }
}

// Saturates instead of truncating durations beyond u64 milliseconds
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_start_poll_interval_ms() -> u64 {
    100
}

// Process spawn is noticeably slower on Windows.
fn default_start_timeout_ms() -> u64 {
    if cfg!(windows) {
        10_000
    } else {
        5_000
    }
}

fn default_enqueue_timeout_ms() -> u64 {
    3_000
}

fn default_sync_initial_interval_ms() -> u64 {
    100
}

fn default_sync_backoff_multiplier() -> f64 {
    1.5
}

fn default_sync_max_interval_ms() -> u64 {
    2_000
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            service_name: default_service_name(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "dagrun".to_string()
}
