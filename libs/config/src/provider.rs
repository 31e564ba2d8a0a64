//! Provider kinds and URL-scheme inference

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker backends known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Plain NATS pub/sub
    Nats,
    /// NATS with the JetStream persistent-stream API
    JetStream,
    /// Redis key-space pub/sub
    Redis,
    /// Kafka partitioned log
    Kafka,
    /// AMQP 0-9-1 broker (RabbitMQ)
    Amqp,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Nats,
        ProviderKind::JetStream,
        ProviderKind::Redis,
        ProviderKind::Kafka,
        ProviderKind::Amqp,
    ];

    /// Lowercase registry id
    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Nats => "nats",
            ProviderKind::JetStream => "jetstream",
            ProviderKind::Redis => "redis",
            ProviderKind::Kafka => "kafka",
            ProviderKind::Amqp => "amqp",
        }
    }

    /// Case-insensitive lookup by registry id
    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    /// Infer the provider from a URL scheme; TLS variants map to their base provider
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "nats" | "tls" => Some(ProviderKind::Nats),
            "redis" | "rediss" => Some(ProviderKind::Redis),
            "kafka" | "kafkas" => Some(ProviderKind::Kafka),
            "amqp" | "amqps" => Some(ProviderKind::Amqp),
            _ => None,
        }
    }

    pub fn infer_from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once("://")?;
        Self::from_scheme(scheme)
    }

    /// Canonical scheme used in sanitized URLs
    pub fn scheme(&self) -> &'static str {
        match self {
            ProviderKind::Nats | ProviderKind::JetStream => "nats",
            ProviderKind::Redis => "redis",
            ProviderKind::Kafka => "kafka",
            ProviderKind::Amqp => "amqp",
        }
    }

    pub fn default_port(&self, tls: bool) -> u16 {
        match self {
            ProviderKind::Nats | ProviderKind::JetStream => 4222,
            ProviderKind::Redis => 6379,
            ProviderKind::Kafka => 9092,
            ProviderKind::Amqp if tls => 5671,
            ProviderKind::Amqp => 5672,
        }
    }

    /// Wildcard pattern that captures all traffic on a connection
    pub fn firehose_pattern(&self) -> &'static str {
        match self {
            ProviderKind::Nats | ProviderKind::JetStream => ">",
            ProviderKind::Redis => "*",
            ProviderKind::Kafka => ">",
            ProviderKind::Amqp => "amq.topic/#",
        }
    }

    /// Whether the firehose starts automatically after connect
    pub fn auto_firehose_default(&self) -> bool {
        matches!(
            self,
            ProviderKind::Nats | ProviderKind::JetStream | ProviderKind::Redis
        )
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, ProviderKind::JetStream)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_inference() {
        assert_eq!(ProviderKind::infer_from_url("nats://localhost:4222"), Some(ProviderKind::Nats));
        assert_eq!(ProviderKind::infer_from_url("tls://demo.nats.io"), Some(ProviderKind::Nats));
        assert_eq!(ProviderKind::infer_from_url("rediss://cache:6380"), Some(ProviderKind::Redis));
        assert_eq!(ProviderKind::infer_from_url("kafkas://b1:9093"), Some(ProviderKind::Kafka));
        assert_eq!(ProviderKind::infer_from_url("AMQPS://rabbit"), Some(ProviderKind::Amqp));
        assert_eq!(ProviderKind::infer_from_url("http://example.com"), None);
        assert_eq!(ProviderKind::infer_from_url("localhost:4222"), None);
    }

    #[test]
    fn test_ids_are_lowercase_and_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(ProviderKind::from_id("JetStream"), Some(ProviderKind::JetStream));
        assert_eq!(ProviderKind::from_id("mqtt"), None);
    }

    #[test]
    fn test_amqp_ports() {
        assert_eq!(ProviderKind::Amqp.default_port(false), 5672);
        assert_eq!(ProviderKind::Amqp.default_port(true), 5671);
    }

    #[test]
    fn test_firehose_defaults() {
        assert!(ProviderKind::Nats.auto_firehose_default());
        assert!(ProviderKind::Redis.auto_firehose_default());
        assert!(!ProviderKind::Kafka.auto_firehose_default());
        assert!(!ProviderKind::Amqp.auto_firehose_default());
        assert_eq!(ProviderKind::Amqp.firehose_pattern(), "amq.topic/#");
    }
}
