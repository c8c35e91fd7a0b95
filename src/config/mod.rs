//! Configuration module
//!
//! Handles loading and validation of the client configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{PushError, PushResult};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Wallet to connect with when none is given on the command line
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub sweeps: Vec<String>,
    #[serde(default)]
    pub consolidations: Vec<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_yaml(&content)?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.push.validate().context("Invalid push section")
    }
}

/// Push channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Base WebSocket URL; `?wallet=<id>` is appended per connection
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Handshake timeout for the WebSocket transport. Unset means none.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:3000/ws".to_string()
}
fn default_heartbeat_interval() -> u64 { 30_000 }
fn default_event_capacity() -> usize { 1024 }

impl PushConfig {
    /// Reject settings the connection actor cannot run with
    pub fn validate(&self) -> PushResult<()> {
        url::Url::parse(&self.endpoint).map_err(|e| {
            PushError::InvalidEndpoint(format!("{}: {}", self.endpoint, e))
        })?;
        ensure(self.heartbeat_interval_ms > 0, "heartbeat_interval_ms must be positive")?;
        ensure(self.event_capacity > 0, "event_capacity must be positive")?;
        ensure(
            self.connect_timeout_ms != Some(0),
            "connect_timeout_ms must be positive when set",
        )?;

        let backoff = &self.backoff;
        ensure(backoff.base_delay_ms > 0, "base_delay_ms must be positive")?;
        ensure(backoff.multiplier >= 1.0, "multiplier must be at least 1.0")?;
        ensure(
            backoff.max_delay_ms >= backoff.base_delay_ms,
            "max_delay_ms must not be below base_delay_ms",
        )?;
        ensure(
            (0.0..=0.5).contains(&backoff.jitter_ratio),
            "jitter_ratio must be between 0 and 0.5",
        )
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            connect_timeout_ms: None,
            event_capacity: default_event_capacity(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn ensure(condition: bool, message: &str) -> PushResult<()> {
    if condition {
        Ok(())
    } else {
        Err(PushError::InvalidConfig(message.to_string()))
    }
}

/// Reconnect backoff: `min(base * multiplier^attempt, max)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, 0 disables it
    #[serde(default)]
    pub jitter_ratio: f64,
}

fn default_base_delay() -> u64 { 1000 }
fn default_multiplier() -> f64 { 1.5 }
fn default_max_delay() -> u64 { 30_000 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            jitter_ratio: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub enable_metrics: bool,
}

fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
            metrics_port: default_metrics_port(),
            enable_metrics: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config.push.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.push.backoff.base_delay_ms, 1000);
        assert_eq!(config.push.backoff.multiplier, 1.5);
        assert_eq!(config.push.backoff.max_delay_ms, 30_000);
        assert!(config.push.connect_timeout().is_none());
        assert!(config.wallet.is_none());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
wallet: "0xWallet"
sweeps: ["abc"]
push:
  endpoint: "wss://push.example.com/ws"
  heartbeat_interval_ms: 15000
  connect_timeout_ms: 8000
  backoff:
    base_delay_ms: 500
    multiplier: 2.0
    max_delay_ms: 10000
    jitter_ratio: 0.1
telemetry:
  log_level: "debug"
  json_logs: true
"#;
        let config = assert_ok!(AppConfig::from_yaml(yaml));
        assert_eq!(config.wallet.as_deref(), Some("0xWallet"));
        assert_eq!(config.sweeps, vec!["abc".to_string()]);
        assert_eq!(config.push.connect_timeout(), Some(Duration::from_secs(8)));
        assert_eq!(config.push.backoff.jitter_ratio, 0.1);
        assert!(config.telemetry.json_logs);
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let yaml = "push:\n  backoff:\n    multiplier: 0.5\n";
        assert!(AppConfig::from_yaml(yaml).is_err());

        let yaml = "push:\n  backoff:\n    jitter_ratio: 0.9\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_push_config_rejects_zero_heartbeat() {
        let mut config = PushConfig::default();
        assert_ok!(config.validate());

        config.heartbeat_interval_ms = 0;
        assert!(matches!(config.validate(), Err(PushError::InvalidConfig(_))));
        assert!(AppConfig::from_yaml("push:\n  heartbeat_interval_ms: 0\n").is_err());
    }

    #[test]
    fn test_with_endpoint_is_validated() {
        let config = PushConfig::default().with_endpoint("wss://push.example.com/ws");
        assert_eq!(config.endpoint, "wss://push.example.com/ws");
        assert_ok!(config.validate());

        let config = PushConfig::default().with_endpoint("not a url");
        assert!(matches!(config.validate(), Err(PushError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        assert!(AppConfig::from_yaml("push:\n  endpoint: \"::nope\"\n").is_err());
    }
}
