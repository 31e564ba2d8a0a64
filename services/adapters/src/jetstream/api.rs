//! `$JS.API` wire types
//!
//! JSON bodies exchanged with the stream management API and their
//! conversions to the broker-neutral types in `mq_types::streaming`.
//! Durations travel as nanoseconds, unset limits as `-1`.

use chrono::{DateTime, Utc};
use mq_types::{
    AckPolicy, BrokerError, ConsumerConfig, ConsumerInfo, DeliverPolicy, PublishAck,
    ReplayPolicy, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamState,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const API_PREFIX: &str = "$JS.API";

/// Stream lookup miss
pub const ERR_STREAM_NOT_FOUND: u64 = 10059;
/// Consumer lookup miss
pub const ERR_CONSUMER_NOT_FOUND: u64 = 10014;

pub fn subject(tail: &str) -> String {
    format!("{}.{}", API_PREFIX, tail)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u64,
    #[serde(default)]
    pub description: String,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self.err_code, ERR_STREAM_NOT_FOUND | ERR_CONSUMER_NOT_FOUND)
    }
}

impl From<ApiError> for BrokerError {
    fn from(err: ApiError) -> Self {
        BrokerError::provider(format!(
            "JetStream API error {} ({}): {}",
            err.code, err.err_code, err.description
        ))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Option<ApiError>,
    #[serde(flatten)]
    body: Option<T>,
}

/// Outcome of decoding an API reply
#[derive(Debug)]
pub enum ApiReply<T> {
    Ok(T),
    Err(ApiError),
}

impl<T> ApiReply<T> {
    pub fn into_result(self) -> Result<T, BrokerError> {
        match self {
            Self::Ok(body) => Ok(body),
            Self::Err(err) => Err(err.into()),
        }
    }

    /// Lookup semantics: a not-found error is `None`
    pub fn into_option(self) -> Result<Option<T>, BrokerError> {
        match self {
            Self::Ok(body) => Ok(Some(body)),
            Self::Err(err) if err.is_not_found() => Ok(None),
            Self::Err(err) => Err(err.into()),
        }
    }
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<ApiReply<T>, BrokerError> {
    let envelope: Envelope<T> = serde_json::from_slice(payload)
        .map_err(|e| BrokerError::provider(format!("malformed JetStream API reply: {}", e)))?;
    match (envelope.error, envelope.body) {
        (Some(err), _) => Ok(ApiReply::Err(err)),
        (None, Some(body)) => Ok(ApiReply::Ok(body)),
        (None, None) => Err(BrokerError::provider("empty JetStream API reply")),
    }
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(value: i64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_nanos(value as u64))
}

fn limit(value: Option<i64>) -> i64 {
    value.unwrap_or(-1)
}

fn limit32(value: Option<i32>) -> i32 {
    value.unwrap_or(-1)
}

fn set_limit<T: PartialOrd + Default>(value: T) -> Option<T> {
    (value > T::default()).then_some(value)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PagedRequest {
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct StreamNamesPage {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub streams: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct StreamListPage {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub streams: Option<Vec<StreamInfoDto>>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumerListPage {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub consumers: Option<Vec<ConsumerInfoDto>>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteReply {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub streams: u64,
    #[serde(default)]
    pub consumers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfigDto {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default = "default_retention")]
    pub retention: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_replicas")]
    pub num_replicas: u32,
    #[serde(default)]
    pub max_age: i64,
    #[serde(default = "unlimited")]
    pub max_bytes: i64,
    #[serde(default = "unlimited")]
    pub max_msgs: i64,
    #[serde(default = "unlimited32")]
    pub max_msg_size: i32,
    #[serde(default = "unlimited32")]
    pub max_consumers: i32,
}

fn default_retention() -> String {
    "limits".into()
}

fn default_storage() -> String {
    "file".into()
}

fn default_replicas() -> u32 {
    1
}

fn unlimited() -> i64 {
    -1
}

fn unlimited32() -> i32 {
    -1
}

impl From<&StreamConfig> for StreamConfigDto {
    fn from(config: &StreamConfig) -> Self {
        Self {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            retention: match config.retention {
                RetentionPolicy::Limits => "limits",
                RetentionPolicy::Interest => "interest",
                RetentionPolicy::WorkQueue => "workqueue",
            }
            .into(),
            storage: match config.storage {
                StorageType::File => "file",
                StorageType::Memory => "memory",
            }
            .into(),
            num_replicas: config.replicas.max(1),
            max_age: config.max_age.map(nanos).unwrap_or(0),
            max_bytes: limit(config.max_bytes),
            max_msgs: limit(config.max_msgs),
            max_msg_size: limit32(config.max_msg_size),
            max_consumers: limit32(config.max_consumers),
        }
    }
}

impl From<StreamConfigDto> for StreamConfig {
    fn from(dto: StreamConfigDto) -> Self {
        Self {
            name: dto.name,
            subjects: dto.subjects,
            retention: match dto.retention.as_str() {
                "interest" => RetentionPolicy::Interest,
                "workqueue" => RetentionPolicy::WorkQueue,
                _ => RetentionPolicy::Limits,
            },
            storage: match dto.storage.as_str() {
                "memory" => StorageType::Memory,
                _ => StorageType::File,
            },
            replicas: dto.num_replicas,
            max_age: from_nanos(dto.max_age),
            max_bytes: set_limit(dto.max_bytes),
            max_msgs: set_limit(dto.max_msgs),
            max_msg_size: set_limit(dto.max_msg_size),
            max_consumers: set_limit(dto.max_consumers),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamStateDto {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfoDto {
    pub config: StreamConfigDto,
    #[serde(default)]
    pub state: StreamStateDto,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

impl From<StreamInfoDto> for StreamInfo {
    fn from(dto: StreamInfoDto) -> Self {
        let state = StreamState {
            messages: dto.state.messages,
            bytes: dto.state.bytes,
            first_sequence: dto.state.first_seq,
            last_sequence: dto.state.last_seq,
            consumer_count: dto.state.consumer_count,
        };
        StreamInfo::new(dto.config.into(), state, dto.created)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfigDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub deliver_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ack_policy: String,
    #[serde(default)]
    pub ack_wait: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default)]
    pub replay_policy: String,
}

impl From<&ConsumerConfig> for ConsumerConfigDto {
    fn from(config: &ConsumerConfig) -> Self {
        let (deliver_policy, opt_start_seq, opt_start_time) = match config.deliver_policy {
            DeliverPolicy::All => ("all", None, None),
            DeliverPolicy::Last => ("last", None, None),
            DeliverPolicy::New => ("new", None, None),
            DeliverPolicy::ByStartSequence(seq) => ("by_start_sequence", Some(seq), None),
            DeliverPolicy::ByStartTime(time) => ("by_start_time", None, Some(time)),
            DeliverPolicy::LastPerSubject => ("last_per_subject", None, None),
        };
        let name = (!config.name.is_empty()).then(|| config.name.clone());
        Self {
            durable_name: if config.durable { name.clone() } else { None },
            name,
            deliver_policy: deliver_policy.into(),
            opt_start_seq,
            opt_start_time,
            ack_policy: match config.ack_policy {
                AckPolicy::Explicit => "explicit",
                AckPolicy::All => "all",
                AckPolicy::None => "none",
            }
            .into(),
            ack_wait: nanos(config.ack_wait),
            max_deliver: config.max_deliver,
            filter_subject: config.filter_subject.clone(),
            replay_policy: match config.replay_policy {
                ReplayPolicy::Instant => "instant",
                ReplayPolicy::Original => "original",
            }
            .into(),
        }
    }
}

impl ConsumerConfigDto {
    fn into_config(self, fallback_name: &str) -> ConsumerConfig {
        let deliver_policy = match self.deliver_policy.as_str() {
            "last" => DeliverPolicy::Last,
            "new" => DeliverPolicy::New,
            "by_start_sequence" => DeliverPolicy::ByStartSequence(self.opt_start_seq.unwrap_or(1)),
            "by_start_time" => self
                .opt_start_time
                .map(DeliverPolicy::ByStartTime)
                .unwrap_or_default(),
            "last_per_subject" => DeliverPolicy::LastPerSubject,
            _ => DeliverPolicy::All,
        };
        ConsumerConfig {
            durable: self.durable_name.is_some(),
            name: self
                .durable_name
                .or(self.name)
                .unwrap_or_else(|| fallback_name.to_string()),
            ack_policy: match self.ack_policy.as_str() {
                "all" => AckPolicy::All,
                "none" => AckPolicy::None,
                _ => AckPolicy::Explicit,
            },
            deliver_policy,
            replay_policy: match self.replay_policy.as_str() {
                "original" => ReplayPolicy::Original,
                _ => ReplayPolicy::Instant,
            },
            ack_wait: from_nanos(self.ack_wait).unwrap_or(Duration::from_secs(30)),
            filter_subject: self.filter_subject.filter(|s| !s.is_empty()),
            max_deliver: self.max_deliver.filter(|n| *n > 0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateConsumerRequest {
    pub stream_name: String,
    pub config: ConsumerConfigDto,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SequencePair {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerInfoDto {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfigDto,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub delivered: SequencePair,
    #[serde(default)]
    pub num_ack_pending: u64,
    #[serde(default)]
    pub num_redelivered: u64,
    #[serde(default)]
    pub num_waiting: u64,
    #[serde(default)]
    pub num_pending: u64,
}

impl From<ConsumerInfoDto> for ConsumerInfo {
    fn from(dto: ConsumerInfoDto) -> Self {
        ConsumerInfo {
            stream: dto.stream_name,
            config: dto.config.into_config(&dto.name),
            num_pending: dto.num_pending,
            num_ack_pending: dto.num_ack_pending,
            num_redelivered: dto.num_redelivered,
            num_waiting: dto.num_waiting,
            delivered_consumer_seq: dto.delivered.consumer_seq,
            delivered_stream_seq: dto.delivered.stream_seq,
            created: dto.created,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PubAckDto {
    pub stream: String,
    pub seq: u64,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub domain: Option<String>,
}

impl From<PubAckDto> for PublishAck {
    fn from(dto: PubAckDto) -> Self {
        PublishAck {
            stream: dto.stream,
            sequence: dto.seq,
            duplicate: dto.duplicate,
            domain: dto.domain.filter(|d| !d.is_empty()),
        }
    }
}

/// Body of a `CONSUMER.MSG.NEXT` pull request
#[derive(Debug, Serialize)]
pub struct PullRequest {
    pub batch: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_wait: bool,
}

impl PullRequest {
    /// A zero `expires` asks for whatever is pending right now
    pub fn new(batch: usize, expires: Duration) -> Self {
        Self {
            batch: batch.max(1),
            expires: (!expires.is_zero()).then(|| nanos(expires)),
            no_wait: expires.is_zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_envelope() {
        let reply = decode::<StreamInfoDto>(
            br#"{"type":"io.nats.jetstream.api.v1.stream_info_response","error":{"code":404,"err_code":10059,"description":"stream not found"}}"#,
        )
        .unwrap();
        match reply {
            ApiReply::Err(err) => {
                assert!(err.is_not_found());
                assert_eq!(err.code, 404);
            }
            ApiReply::Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_not_found_is_none_for_lookups() {
        let reply = decode::<ConsumerInfoDto>(
            br#"{"error":{"code":404,"err_code":10014,"description":"consumer not found"}}"#,
        )
        .unwrap();
        assert!(reply.into_option().unwrap().is_none());

        let reply = decode::<ConsumerInfoDto>(
            br#"{"error":{"code":500,"err_code":10049,"description":"insufficient resources"}}"#,
        )
        .unwrap();
        assert!(matches!(reply.into_option(), Err(BrokerError::ProviderError(_))));
    }

    #[test]
    fn test_stream_info_conversion() {
        let reply = decode::<StreamInfoDto>(
            br#"{"config":{"name":"ORDERS","subjects":["orders.>"],"retention":"workqueue","storage":"memory","num_replicas":1,"max_age":60000000000,"max_bytes":-1,"max_msgs":-1},
                "created":"2024-03-01T10:00:00Z",
                "state":{"messages":0,"bytes":0,"first_seq":11,"last_seq":10,"consumer_count":2}}"#,
        )
        .unwrap();
        let ApiReply::Ok(dto) = reply else {
            panic!("expected stream info");
        };
        let info = StreamInfo::from(dto);
        assert_eq!(info.name(), "ORDERS");
        assert_eq!(info.config.retention, RetentionPolicy::WorkQueue);
        assert_eq!(info.config.storage, StorageType::Memory);
        assert_eq!(info.config.max_age, Some(Duration::from_secs(60)));
        assert_eq!(info.config.max_bytes, None);
        assert_eq!(info.state.first_sequence, 10);
        assert_eq!(info.state.consumer_count, 2);
    }

    #[test]
    fn test_consumer_config_wire_shape() {
        let config = ConsumerConfig::durable("tap")
            .with_filter_subject("orders.created")
            .with_deliver_policy(DeliverPolicy::ByStartSequence(42));
        let json = serde_json::to_value(ConsumerConfigDto::from(&config)).unwrap();
        assert_eq!(json["durable_name"], "tap");
        assert_eq!(json["deliver_policy"], "by_start_sequence");
        assert_eq!(json["opt_start_seq"], 42);
        assert_eq!(json["ack_policy"], "explicit");
        assert_eq!(json["ack_wait"], 30_000_000_000i64);

        let ephemeral = serde_json::to_value(ConsumerConfigDto::from(&ConsumerConfig::ephemeral("e1"))).unwrap();
        assert!(ephemeral.get("durable_name").is_none());
    }

    #[test]
    fn test_consumer_info_conversion() {
        let reply = decode::<ConsumerInfoDto>(
            br#"{"stream_name":"ORDERS","name":"tap","created":"2024-03-01T10:00:00Z",
                "config":{"durable_name":"tap","deliver_policy":"all","ack_policy":"explicit","ack_wait":30000000000,"filter_subject":"orders.*","replay_policy":"instant"},
                "delivered":{"consumer_seq":3,"stream_seq":9},"num_ack_pending":1,"num_redelivered":0,"num_waiting":0,"num_pending":4}"#,
        )
        .unwrap();
        let ApiReply::Ok(dto) = reply else {
            panic!("expected consumer info");
        };
        let info = ConsumerInfo::from(dto);
        assert_eq!(info.name(), "tap");
        assert!(info.config.durable);
        assert_eq!(info.config.filter_subject.as_deref(), Some("orders.*"));
        assert_eq!(info.delivered_stream_seq, 9);
        assert_eq!(info.num_pending, 4);
    }

    #[test]
    fn test_pull_request_body() {
        let body = serde_json::to_string(&PullRequest::new(5, Duration::from_millis(200))).unwrap();
        assert_eq!(body, r#"{"batch":5,"expires":200000000}"#);
        let body = serde_json::to_string(&PullRequest::new(0, Duration::ZERO)).unwrap();
        assert_eq!(body, r#"{"batch":1,"no_wait":true}"#);
    }
}
