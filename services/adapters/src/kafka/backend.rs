//! Partitioned-log backend seam
//!
//! The adapter drives a [`LogBackend`]: a producer, one group consumer whose
//! topic set is replaced wholesale, metadata and watermark lookups, and a
//! bounded read from explicit offsets. [`MemoryLog`] is an in-process
//! backend; the librdkafka one lives behind the `kafka` feature.

use super::settings::KafkaSettings;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mq_config::KafkaTuning;
use mq_types::{BrokerError, BrokerResult, Headers};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A record read from the log
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: Headers,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A record to append
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: Headers,
}

/// Offsets bounding one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWatermarks {
    pub partition: i32,
    pub low: i64,
    pub high: i64,
}

impl PartitionWatermarks {
    /// First offset of the last `count` records
    pub fn tail_start(&self, count: usize) -> i64 {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.low.max(self.high.saturating_sub(count))
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }
}

#[async_trait]
pub trait LogBackend: Send + Sync + fmt::Debug {
    /// Topic names known to the cluster
    async fn topics(&self) -> BrokerResult<Vec<String>>;

    async fn produce(&self, record: OutgoingRecord) -> BrokerResult<()>;

    /// Replace the group consumer's topic set; empty unsubscribes
    async fn subscribe(&self, topics: &[String]) -> BrokerResult<()>;

    /// Next record for the group consumer, `None` when `wait` passes quietly
    async fn poll(&self, wait: Duration) -> BrokerResult<Option<LogRecord>>;

    async fn watermarks(&self, topic: &str) -> BrokerResult<Vec<PartitionWatermarks>>;

    /// Read from explicit `(partition, offset)` starts on a temporary
    /// assignment until `limit` records arrive or `deadline` passes
    async fn read_from(
        &self,
        topic: &str,
        starts: &[(i32, i64)],
        limit: usize,
        deadline: Duration,
    ) -> BrokerResult<Vec<LogRecord>>;

    async fn close(&self);
}

/// Opens backends for the adapter's `connect`
#[async_trait]
pub trait LogConnector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        brokers: &[String],
        settings: &KafkaSettings,
        tuning: &KafkaTuning,
    ) -> BrokerResult<Arc<dyn LogBackend>>;
}

/// Connector for builds without a client library
#[derive(Debug, Default)]
pub struct UnavailableConnector;

#[async_trait]
impl LogConnector for UnavailableConnector {
    async fn connect(
        &self,
        _brokers: &[String],
        _settings: &KafkaSettings,
        _tuning: &KafkaTuning,
    ) -> BrokerResult<Arc<dyn LogBackend>> {
        Err(BrokerError::not_supported(
            "Kafka client not built in (enable the `kafka` feature)",
        ))
    }
}

// ============================================================================
// IN-MEMORY LOG
// ============================================================================

#[derive(Debug, Clone)]
struct Stored {
    arrival: u64,
    record: LogRecord,
}

#[derive(Debug, Default)]
struct LogState {
    topics: BTreeMap<String, Vec<Vec<Stored>>>,
    subscribed: BTreeSet<String>,
    /// Group consumer position per (topic, partition)
    positions: HashMap<(String, i32), i64>,
    arrivals: u64,
    closed: bool,
}

impl LogState {
    /// Oldest unread record across the subscribed partitions
    fn next_for_group(&mut self) -> Option<LogRecord> {
        let mut best: Option<(u64, String, i32)> = None;
        for topic in &self.subscribed {
            let Some(partitions) = self.topics.get(topic) else {
                continue;
            };
            for (index, records) in partitions.iter().enumerate() {
                let partition = index as i32;
                let position = self
                    .positions
                    .get(&(topic.clone(), partition))
                    .copied()
                    .unwrap_or(0);
                if let Some(stored) = records.get(position as usize) {
                    if best.as_ref().map_or(true, |(arrival, _, _)| stored.arrival < *arrival) {
                        best = Some((stored.arrival, topic.clone(), partition));
                    }
                }
            }
        }

        let (_, topic, partition) = best?;
        let position = self.positions.entry((topic.clone(), partition)).or_insert(0);
        let stored = self.topics.get(&topic)?.get(partition as usize)?.get(*position as usize)?;
        *position += 1;
        Some(stored.record.clone())
    }
}

/// In-process partitioned log
///
/// Topics are created on first produce with one partition unless declared
/// with [`MemoryLog::create_topic`]. A newly subscribed topic is read from its
/// current end, like a group consumer with `auto.offset.reset=latest`.
#[derive(Default)]
pub struct MemoryLog {
    state: Mutex<LogState>,
    arrivals: Notify,
}

impl fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryLog")
            .field("topics", &state.topics.len())
            .field("subscribed", &state.subscribed)
            .finish()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state.lock();
        let entry = state.topics.entry(topic.to_string()).or_default();
        while entry.len() < partitions.max(1) {
            entry.push(Vec::new());
        }
    }

    /// Records currently stored in `topic`
    pub fn len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|p| p.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn partition_for(key: Option<&Bytes>, partitions: usize) -> usize {
        match key {
            Some(key) if partitions > 1 => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as usize
            }
            _ => 0,
        }
    }
}

#[async_trait]
impl LogBackend for MemoryLog {
    async fn topics(&self) -> BrokerResult<Vec<String>> {
        Ok(self.state.lock().topics.keys().cloned().collect())
    }

    async fn produce(&self, record: OutgoingRecord) -> BrokerResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::NotConnected);
            }
            state.arrivals += 1;
            let arrival = state.arrivals;
            let partitions = state.topics.entry(record.topic.clone()).or_default();
            if partitions.is_empty() {
                partitions.push(Vec::new());
            }
            let index = Self::partition_for(record.key.as_ref(), partitions.len());
            let log = &mut partitions[index];
            let stored = LogRecord {
                topic: record.topic,
                partition: index as i32,
                offset: log.len() as i64,
                key: record.key,
                payload: record.payload,
                headers: record.headers,
                timestamp: Some(Utc::now()),
            };
            log.push(Stored {
                arrival,
                record: stored,
            });
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let wanted: BTreeSet<String> = topics.iter().cloned().collect();
        for topic in wanted.difference(&state.subscribed).cloned().collect::<Vec<_>>() {
            let ends: Vec<(i32, i64)> = state
                .topics
                .get(&topic)
                .map(|p| {
                    p.iter()
                        .enumerate()
                        .map(|(i, r)| (i as i32, r.len() as i64))
                        .collect()
                })
                .unwrap_or_default();
            for (partition, end) in ends {
                state.positions.insert((topic.clone(), partition), end);
            }
        }
        state.positions.retain(|(topic, _), _| wanted.contains(topic));
        state.subscribed = wanted;
        Ok(())
    }

    async fn poll(&self, wait: Duration) -> BrokerResult<Option<LogRecord>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(BrokerError::NotConnected);
                }
                if let Some(record) = state.next_for_group() {
                    return Ok(Some(record));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn watermarks(&self, topic: &str) -> BrokerResult<Vec<PartitionWatermarks>> {
        let state = self.state.lock();
        let partitions = state.topics.get(topic).ok_or_else(|| {
            BrokerError::provider(format!("unknown topic '{}'", topic))
        })?;
        Ok(partitions
            .iter()
            .enumerate()
            .map(|(i, records)| PartitionWatermarks {
                partition: i as i32,
                low: 0,
                high: records.len() as i64,
            })
            .collect())
    }

    async fn read_from(
        &self,
        topic: &str,
        starts: &[(i32, i64)],
        limit: usize,
        _deadline: Duration,
    ) -> BrokerResult<Vec<LogRecord>> {
        let state = self.state.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for &(partition, start) in starts {
            if let Some(log) = partitions.get(partition as usize) {
                let start = start.max(0) as usize;
                records.extend(log.iter().skip(start).map(|s| s.record.clone()));
            }
        }
        records.truncate(limit);
        Ok(records)
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribed.clear();
        drop(state);
        self.arrivals.notify_waiters();
    }
}

/// Connector handing out one shared [`MemoryLog`]
///
/// Reconnecting reopens the same log, so produced records survive.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    log: Arc<MemoryLog>,
}

impl MemoryConnector {
    pub fn new(log: Arc<MemoryLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }
}

#[async_trait]
impl LogConnector for MemoryConnector {
    async fn connect(
        &self,
        _brokers: &[String],
        _settings: &KafkaSettings,
        _tuning: &KafkaTuning,
    ) -> BrokerResult<Arc<dyn LogBackend>> {
        self.log.state.lock().closed = false;
        Ok(self.log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, payload: &'static str) -> OutgoingRecord {
        OutgoingRecord {
            topic: topic.to_string(),
            key: None,
            payload: Bytes::from_static(payload.as_bytes()),
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_tail_start_is_clamped_to_low() {
        let marks = PartitionWatermarks { partition: 0, low: 5, high: 8 };
        assert_eq!(marks.tail_start(2), 6);
        assert_eq!(marks.tail_start(10), 5);
        assert!(!marks.is_empty());
    }

    #[tokio::test]
    async fn test_group_reads_only_new_records() {
        let log = MemoryLog::new();
        log.produce(record("orders", "old")).await.unwrap();
        log.subscribe(&["orders".to_string()]).await.unwrap();
        assert_eq!(log.poll(Duration::from_millis(10)).await.unwrap(), None);

        log.produce(record("orders", "new")).await.unwrap();
        let got = log.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"new"));
        assert_eq!(got.offset, 1);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_produce() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("orders", 1);
        log.subscribe(&["orders".to_string()]).await.unwrap();

        let producer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce(record("orders", "x")).await.unwrap();
        });
        let got = log.poll(Duration::from_secs(2)).await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_read_from_and_watermarks() {
        let log = MemoryLog::new();
        for payload in ["a", "b", "c", "d"] {
            log.produce(record("audit", payload)).await.unwrap();
        }
        let marks = log.watermarks("audit").await.unwrap();
        assert_eq!(marks, vec![PartitionWatermarks { partition: 0, low: 0, high: 4 }]);

        let records = log
            .read_from("audit", &[(0, marks[0].tail_start(2))], 2, Duration::from_millis(10))
            .await
            .unwrap();
        let payloads: Vec<_> = records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"c"), Bytes::from_static(b"d")]);
    }

    #[tokio::test]
    async fn test_closed_log_rejects_produce() {
        let log = MemoryLog::new();
        log.close().await;
        assert_eq!(log.produce(record("a", "x")).await, Err(BrokerError::NotConnected));
    }
}
