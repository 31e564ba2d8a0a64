//! librdkafka backend
//!
//! One `FutureProducer`, one group `StreamConsumer` and short-lived
//! manually assigned consumers for tail reads. Metadata and watermark calls
//! block inside librdkafka and run on the blocking pool.

use super::backend::{LogBackend, LogConnector, LogRecord, OutgoingRecord, PartitionWatermarks};
use super::settings::KafkaSettings;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use mq_config::KafkaTuning;
use mq_types::{BrokerError, BrokerResult, Headers};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

fn provider_error(context: &str, err: KafkaError) -> BrokerError {
    BrokerError::provider(format!("{}: {}", context, err))
}

fn client_config(brokers: &[String], props: Vec<(&'static str, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", brokers.join(","));
    for (key, value) in props {
        config.set(key, value);
    }
    config
}

fn to_record(message: &BorrowedMessage<'_>) -> LogRecord {
    let mut headers = Headers::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            headers.insert(header.key.to_string(), value);
        }
    }
    LogRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    }
}

pub struct RdKafkaBackend {
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
    brokers: Vec<String>,
    settings: KafkaSettings,
    tuning: KafkaTuning,
}

impl fmt::Debug for RdKafkaBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdKafkaBackend")
            .field("brokers", &self.brokers)
            .finish()
    }
}

impl RdKafkaBackend {
    pub fn open(brokers: &[String], settings: &KafkaSettings, tuning: &KafkaTuning) -> BrokerResult<Self> {
        let producer: FutureProducer = client_config(brokers, settings.producer_properties())
            .create()
            .map_err(|e| BrokerError::connection_failed(format!("Kafka producer: {}", e)))?;

        let mut consumer_config = client_config(brokers, settings.consumer_properties());
        if settings.group_id.is_none() {
            consumer_config.set("group.id", format!("mqtap-{}", Uuid::new_v4().simple()));
        }
        if settings.auto_offset_reset.is_none() {
            consumer_config.set("auto.offset.reset", "latest");
        }
        let consumer: StreamConsumer = consumer_config
            .create()
            .map_err(|e| BrokerError::connection_failed(format!("Kafka consumer: {}", e)))?;

        Ok(Self {
            producer,
            consumer: Arc::new(consumer),
            brokers: brokers.to_vec(),
            settings: settings.clone(),
            tuning: tuning.clone(),
        })
    }

    /// Fail fast when no broker answers metadata
    async fn verify(&self) -> BrokerResult<()> {
        self.topics().await.map(|topics| {
            info!(brokers = ?self.brokers, topics = topics.len(), "Kafka metadata reachable");
        })
    }

    fn tail_consumer(&self) -> BrokerResult<StreamConsumer> {
        let mut config = client_config(&self.brokers, self.settings.client_properties());
        config
            .set("group.id", format!("mqtap-tail-{}", Uuid::new_v4().simple()))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");
        config
            .create()
            .map_err(|e| provider_error("Kafka tail consumer", e))
    }
}

#[async_trait]
impl LogBackend for RdKafkaBackend {
    async fn topics(&self) -> BrokerResult<Vec<String>> {
        let consumer = self.consumer.clone();
        let wait = self.tuning.metadata_timeout();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, Timeout::After(wait))
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .map(|t| t.name().to_string())
                        .collect()
                })
                .map_err(|e| BrokerError::connection_failed(format!("Kafka metadata: {}", e)))
        })
        .await
        .map_err(|e| BrokerError::provider(format!("metadata task: {}", e)))?
    }

    async fn produce(&self, record: OutgoingRecord) -> BrokerResult<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }
        let mut outgoing: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic)
            .payload(record.payload.as_ref())
            .headers(headers);
        if let Some(key) = record.key.as_ref() {
            outgoing = outgoing.key(key.as_ref());
        }
        self.producer
            .send(outgoing, Timeout::After(self.tuning.metadata_timeout()))
            .await
            .map(|(partition, offset)| {
                debug!(topic = %record.topic, partition, offset, "Record delivered");
            })
            .map_err(|(e, _)| BrokerError::publish_failed(e.to_string()))
    }

    async fn subscribe(&self, topics: &[String]) -> BrokerResult<()> {
        if topics.is_empty() {
            self.consumer.unsubscribe();
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| BrokerError::subscription_failed(e.to_string()))
    }

    async fn poll(&self, wait: Duration) -> BrokerResult<Option<LogRecord>> {
        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_record(&message))),
            Ok(Err(e)) => Err(provider_error("Kafka poll", e)),
        }
    }

    async fn watermarks(&self, topic: &str) -> BrokerResult<Vec<PartitionWatermarks>> {
        let consumer = self.consumer.clone();
        let topic = topic.to_string();
        let wait = self.tuning.metadata_timeout();
        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), Timeout::After(wait))
                .map_err(|e| provider_error("Kafka metadata", e))?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            partitions
                .into_iter()
                .map(|partition| {
                    consumer
                        .fetch_watermarks(&topic, partition, Timeout::After(wait))
                        .map(|(low, high)| PartitionWatermarks { partition, low, high })
                        .map_err(|e| provider_error("Kafka watermarks", e))
                })
                .collect()
        })
        .await
        .map_err(|e| BrokerError::provider(format!("watermark task: {}", e)))?
    }

    async fn read_from(
        &self,
        topic: &str,
        starts: &[(i32, i64)],
        limit: usize,
        deadline: Duration,
    ) -> BrokerResult<Vec<LogRecord>> {
        if starts.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let consumer = self.tail_consumer()?;
        let mut assignment = TopicPartitionList::new();
        for &(partition, offset) in starts {
            assignment
                .add_partition_offset(topic, partition, Offset::Offset(offset))
                .map_err(|e| provider_error("Kafka assignment", e))?;
        }
        consumer
            .assign(&assignment)
            .map_err(|e| provider_error("Kafka assignment", e))?;

        let mut records = Vec::new();
        let stop = tokio::time::Instant::now() + deadline;
        while records.len() < limit {
            match tokio::time::timeout_at(stop, consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => records.push(to_record(&message)),
                Ok(Err(e)) => {
                    debug!(topic = %topic, error = %e, "Tail read interrupted");
                    break;
                }
            }
        }
        if let Err(e) = consumer.unassign() {
            debug!(topic = %topic, error = %e, "Releasing tail assignment failed");
        }
        Ok(records)
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
    }
}

#[derive(Debug, Default)]
pub struct RdKafkaConnector;

#[async_trait]
impl LogConnector for RdKafkaConnector {
    async fn connect(
        &self,
        brokers: &[String],
        settings: &KafkaSettings,
        tuning: &KafkaTuning,
    ) -> BrokerResult<Arc<dyn LogBackend>> {
        let backend = RdKafkaBackend::open(brokers, settings, tuning)?;
        backend.verify().await?;
        Ok(Arc::new(backend))
    }
}
