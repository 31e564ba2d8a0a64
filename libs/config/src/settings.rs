//! Session Settings
//!
//! Tunables for the orchestrator and the protocol adapters. Loaded from an
//! optional TOML file with `MQTAP__`-prefixed environment overrides, e.g.
//! `MQTAP__RETENTION_LIMIT=500` or `MQTAP__AMQP__HEARTBEAT_SECS=30`.

use crate::error::SettingsError;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MQTAP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub log_level: String,
    /// Messages kept per buffer (live, paused, durable)
    pub retention_limit: usize,
    /// Remembered dedup keys
    pub dedup_window: usize,
    pub event_log_limit: usize,
    pub timeouts: TimeoutSettings,
    pub amqp: AmqpSettings,
    pub nats: NatsSettings,
    pub kafka: KafkaTuning,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            retention_limit: 1000,
            dedup_window: 10_000,
            event_log_limit: 500,
            timeouts: TimeoutSettings::default(),
            amqp: AmqpSettings::default(),
            nats: NatsSettings::default(),
            kafka: KafkaTuning::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_ms: u64,
    pub handshake_ms: u64,
    pub rpc_ms: u64,
    pub request_ms: u64,
    pub disconnect_ms: u64,
    /// Extra time a pull fetch waits beyond its own expiry
    pub fetch_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            handshake_ms: 10_000,
            rpc_ms: 10_000,
            request_ms: 5_000,
            disconnect_ms: 2_000,
            fetch_grace_ms: 250,
        }
    }
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_millis(self.rpc_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }

    pub fn fetch_grace(&self) -> Duration {
        Duration::from_millis(self.fetch_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// Heartbeat requested during tuning; the lower of client and server wins
    pub heartbeat_secs: u16,
    /// Per-subscription prefetch; 0 leaves the broker default
    pub prefetch: u16,
    pub client_name: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            prefetch: 0,
            client_name: "mqtap".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub ping_interval_secs: u64,
    pub max_pings_outstanding: u32,
    /// Messages requested per pull in continuous consumption
    pub pull_batch: usize,
    pub pull_expires_ms: u64,
    pub client_name: String,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 120,
            max_pings_outstanding: 2,
            pull_batch: 100,
            pull_expires_ms: 5_000,
            client_name: "mqtap".to_string(),
        }
    }
}

impl NatsSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pull_expires(&self) -> Duration {
        Duration::from_millis(self.pull_expires_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaTuning {
    pub poll_timeout_ms: u64,
    pub metadata_timeout_ms: u64,
    /// Deadline for collecting the last N records of a topic
    pub fetch_last_deadline_ms: u64,
}

impl Default for KafkaTuning {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 250,
            metadata_timeout_ms: 5_000,
            fetch_last_deadline_ms: 3_000,
        }
    }
}

impl KafkaTuning {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn fetch_last_deadline(&self) -> Duration {
        Duration::from_millis(self.fetch_last_deadline_ms)
    }
}

impl SessionSettings {
    /// Load settings from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading session settings: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (MQTAP__ prefix)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let settings: SessionSettings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let settings: SessionSettings =
            toml::from_str(source).context("Failed to parse settings TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), SettingsError> {
        if self.retention_limit == 0 {
            return Err(SettingsError::invalid("retention_limit", "must be at least 1"));
        }
        if self.dedup_window == 0 {
            return Err(SettingsError::invalid("dedup_window", "must be at least 1"));
        }
        let timeouts = [
            ("timeouts.connect_ms", self.timeouts.connect_ms),
            ("timeouts.handshake_ms", self.timeouts.handshake_ms),
            ("timeouts.rpc_ms", self.timeouts.rpc_ms),
            ("timeouts.request_ms", self.timeouts.request_ms),
            ("timeouts.disconnect_ms", self.timeouts.disconnect_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(SettingsError::invalid(field, "must be non-zero"));
            }
        }
        if self.nats.pull_batch == 0 {
            return Err(SettingsError::invalid("nats.pull_batch", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SessionSettings::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = SessionSettings::from_toml_str(
            r#"
            retention_limit = 250

            [amqp]
            prefetch = 50
            "#,
        )
        .unwrap();
        assert_eq!(settings.retention_limit, 250);
        assert_eq!(settings.amqp.prefetch, 50);
        assert_eq!(settings.amqp.heartbeat_secs, 60);
        assert_eq!(settings.timeouts, TimeoutSettings::default());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let err = SessionSettings::from_toml_str("retention_limit = 0").unwrap_err();
        assert!(err.to_string().contains("retention_limit"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "event_log_limit = 42\n[nats]\npull_batch = 7").unwrap();

        let settings = SessionSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.event_log_limit, 42);
        assert_eq!(settings.nats.pull_batch, 7);
        assert_eq!(settings.kafka, KafkaTuning::default());
    }
}
