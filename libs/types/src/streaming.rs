//! Persistent stream and consumer value types
//!
//! Broker-neutral descriptions of streams, consumers and publish
//! acknowledgements. Adapters translate these to and from their wire formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Stream definition used for creation and reported back by info calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageType,
    pub replicas: u32,
    pub max_age: Option<Duration>,
    pub max_bytes: Option<i64>,
    pub max_msgs: Option<i64>,
    pub max_msg_size: Option<i32>,
    pub max_consumers: Option<i32>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            replicas: 1,
            max_age: None,
            max_bytes: None,
            max_msgs: None,
            max_msg_size: None,
            max_consumers: None,
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Message counters of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

impl StreamState {
    /// Clamp the first sequence so `last_sequence >= first_sequence` holds.
    ///
    /// Brokers report `first = last + 1` for a purged, empty stream.
    pub fn normalized(mut self) -> Self {
        if self.last_sequence < self.first_sequence {
            self.first_sequence = self.last_sequence;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
    pub created: DateTime<Utc>,
}

impl StreamInfo {
    pub fn new(config: StreamConfig, state: StreamState, created: DateTime<Utc>) -> Self {
        Self {
            config,
            state: state.normalized(),
            created,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckPolicy {
    #[default]
    Explicit,
    All,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence(u64),
    ByStartTime(DateTime<Utc>),
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Consumer definition; `durable` consumers survive client disconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub durable: bool,
    pub ack_policy: AckPolicy,
    pub deliver_policy: DeliverPolicy,
    pub replay_policy: ReplayPolicy,
    pub ack_wait: Duration,
    pub filter_subject: Option<String>,
    pub max_deliver: Option<i64>,
}

impl ConsumerConfig {
    /// Durable pull consumer with explicit acks
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            ack_wait: Duration::from_secs(30),
            filter_subject: None,
            max_deliver: None,
        }
    }

    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            durable: false,
            ..Self::durable(name)
        }
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream: String,
    pub config: ConsumerConfig,
    pub num_pending: u64,
    pub num_ack_pending: u64,
    pub num_redelivered: u64,
    pub num_waiting: u64,
    pub delivered_consumer_seq: u64,
    pub delivered_stream_seq: u64,
    pub created: DateTime<Utc>,
}

impl ConsumerInfo {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Broker confirmation of a persistent publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
    pub domain: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purged_stream_state_is_normalized() {
        let state = StreamState {
            messages: 0,
            bytes: 0,
            first_sequence: 11,
            last_sequence: 10,
            consumer_count: 0,
        };
        let info = StreamInfo::new(StreamConfig::new("ORDERS", vec![]), state, Utc::now());
        assert!(info.state.last_sequence >= info.state.first_sequence);
        assert_eq!(info.state.first_sequence, 10);
    }

    #[test]
    fn test_consumer_builders() {
        let config = ConsumerConfig::ephemeral("tap")
            .with_filter_subject("orders.>")
            .with_deliver_policy(DeliverPolicy::ByStartSequence(5));
        assert!(!config.durable);
        assert_eq!(config.filter_subject.as_deref(), Some("orders.>"));
        assert_eq!(config.deliver_policy, DeliverPolicy::ByStartSequence(5));
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn test_stream_config_serializes() {
        let config = StreamConfig::new("ORDERS", vec!["orders.*".into()])
            .with_storage(StorageType::Memory);
        let json = serde_json::to_string(&config).unwrap();
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
