//! # Kafka Adapter
//!
//! Topic taps over a partitioned log. All subscriptions share one group
//! consumer subscribed to the union of their matched topics; a single poll
//! task fans each record out to every open subscription whose pattern
//! matches its topic.
//!
//! The log itself sits behind [`LogBackend`]: librdkafka with the `kafka`
//! feature, or the in-process [`MemoryLog`].

pub mod backend;
pub mod pattern;
#[cfg(feature = "kafka")]
pub mod rdkafka_backend;
pub mod settings;

pub use backend::{
    LogBackend, LogConnector, LogRecord, MemoryConnector, MemoryLog, OutgoingRecord,
    PartitionWatermarks, UnavailableConnector,
};
pub use pattern::TopicMatcher;
pub use settings::{KafkaSettings, KAFKA_CONFIG_OPTION};

use crate::common::{BasicClient, CancelHandle, StateNotifier, Subscription, SubscriptionSender, TaskSet};
use crate::common::spawn_detached;
use async_trait::async_trait;
use mq_config::{broker_addresses, KafkaTuning, ProviderKind, SessionSettings};
use mq_types::{BrokerError, BrokerResult, ConnectionConfig, ConnectionState, UnifiedMessage};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const HEADER_PARTITION: &str = "kafka.partition";
pub const HEADER_OFFSET: &str = "kafka.offset";
pub const HEADER_KEY: &str = "kafka.key";

/// Unified view of a log record; partition and offset land in headers
pub fn record_message(record: LogRecord) -> UnifiedMessage {
    let mut headers = record.headers;
    headers.insert(HEADER_PARTITION.to_string(), record.partition.to_string());
    headers.insert(HEADER_OFFSET.to_string(), record.offset.to_string());
    if let Some(key) = &record.key {
        headers.insert(HEADER_KEY.to_string(), String::from_utf8_lossy(key).into_owned());
    }
    let message = UnifiedMessage::new(record.topic, record.payload).with_headers(headers);
    match record.timestamp {
        Some(timestamp) => message.with_timestamp(timestamp),
        None => message,
    }
}

struct Route {
    id: u64,
    pattern: String,
    matcher: TopicMatcher,
    tx: SubscriptionSender<UnifiedMessage>,
}

/// Per-connection state: backend, topic cache and subscription routes
struct KafkaSession {
    backend: Arc<dyn LogBackend>,
    tuning: KafkaTuning,
    topics: Mutex<Vec<String>>,
    routes: Mutex<Vec<Route>>,
    next_route: AtomicU64,
    polling: AtomicBool,
    tasks: TaskSet,
}

impl KafkaSession {
    fn new(backend: Arc<dyn LogBackend>, tuning: KafkaTuning) -> Self {
        Self {
            backend,
            tuning,
            topics: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            next_route: AtomicU64::new(1),
            polling: AtomicBool::new(false),
            tasks: TaskSet::new(),
        }
    }

    async fn refresh_topics(&self) -> BrokerResult<Vec<String>> {
        let mut topics: Vec<String> = self
            .backend
            .topics()
            .await?
            .into_iter()
            .filter(|t| !t.starts_with("__"))
            .collect();
        topics.sort();
        topics.dedup();
        *self.topics.lock() = topics.clone();
        debug!(count = topics.len(), "Topic cache refreshed");
        Ok(topics)
    }

    /// Union of the topics every open route selects
    fn wanted_topics(&self) -> Vec<String> {
        let known = self.topics.lock().clone();
        let routes = self.routes.lock();
        let wanted: BTreeSet<String> = routes
            .iter()
            .flat_map(|r| r.matcher.select(&known).into_iter().map(str::to_string).collect::<Vec<_>>())
            .collect();
        wanted.into_iter().collect()
    }

    async fn resubscribe(&self) -> BrokerResult<()> {
        let topics = self.wanted_topics();
        debug!(topics = ?topics, "Updating consumer subscription");
        self.backend.subscribe(&topics).await
    }

    fn remove_route(&self, id: u64) -> bool {
        let mut routes = self.routes.lock();
        let before = routes.len();
        routes.retain(|r| r.id != id);
        routes.len() != before
    }

    fn dispatch(&self, record: LogRecord) {
        let mut routes = self.routes.lock();
        if !routes.iter().any(|r| r.matcher.matches(&record.topic)) {
            return;
        }
        let message = record_message(record);
        routes.retain(|route| {
            if !route.matcher.matches(message.subject()) {
                return true;
            }
            route.tx.send(Ok(message.clone())).is_ok()
        });
    }

    fn fail_routes(&self, err: BrokerError) {
        for route in self.routes.lock().drain(..) {
            let _ = route.tx.send(Err(err.clone()));
        }
    }

    fn ensure_polling(self: &Arc<Self>) {
        if self.polling.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.spawn(poll_loop(Arc::downgrade(self), self.backend.clone(), self.tuning.clone()));
    }
}

async fn poll_loop(session: Weak<KafkaSession>, backend: Arc<dyn LogBackend>, tuning: KafkaTuning) {
    let wait = tuning.poll_timeout();
    loop {
        let polled = backend.poll(wait).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        match polled {
            Ok(Some(record)) => session.dispatch(record),
            Ok(None) => {}
            Err(BrokerError::NotConnected) => {
                session.fail_routes(BrokerError::subscription_failed("Kafka consumer closed"));
                return;
            }
            Err(e) => {
                warn!(error = %e, "Kafka poll failed");
                drop(session);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

struct KafkaCancel {
    session: Weak<KafkaSession>,
    route: u64,
    done: AtomicBool,
}

impl CancelHandle for KafkaCancel {
    fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.remove_route(self.route) {
            spawn_detached(async move {
                if let Err(e) = session.resubscribe().await {
                    debug!(error = %e, "Resubscribe after cancel failed");
                }
            });
        }
    }
}

/// Kafka provider over a [`LogConnector`]
pub struct KafkaClient {
    connector: Arc<dyn LogConnector>,
    tuning: KafkaTuning,
    state: Arc<StateNotifier>,
    session: Mutex<Option<Arc<KafkaSession>>>,
}

impl std::fmt::Debug for KafkaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaClient")
            .field("connector", &self.connector)
            .field("state", &self.state.get())
            .finish()
    }
}

impl KafkaClient {
    pub fn new(connector: Arc<dyn LogConnector>, settings: &SessionSettings) -> Self {
        Self {
            connector,
            tuning: settings.kafka.clone(),
            state: Arc::new(StateNotifier::new()),
            session: Mutex::new(None),
        }
    }

    /// True when this build links a real partitioned-log client
    pub fn backend_available() -> bool {
        cfg!(feature = "kafka")
    }

    /// librdkafka when built with the `kafka` feature
    pub fn with_default_backend(settings: &SessionSettings) -> Self {
        #[cfg(feature = "kafka")]
        let connector: Arc<dyn LogConnector> = Arc::new(rdkafka_backend::RdKafkaConnector);
        #[cfg(not(feature = "kafka"))]
        let connector: Arc<dyn LogConnector> = Arc::new(UnavailableConnector);
        Self::new(connector, settings)
    }

    pub fn in_memory(log: Arc<MemoryLog>, settings: &SessionSettings) -> Self {
        Self::new(Arc::new(MemoryConnector::new(log)), settings)
    }

    fn session(&self) -> BrokerResult<Arc<KafkaSession>> {
        self.session.lock().clone().ok_or(BrokerError::NotConnected)
    }

    async fn open(&self, config: &ConnectionConfig) -> BrokerResult<Arc<KafkaSession>> {
        let brokers: Vec<String> =
            broker_addresses(&config.url, ProviderKind::Kafka.default_port(config.tls))?
                .into_iter()
                .map(|a| a.to_string())
                .collect();
        if brokers.is_empty() {
            return Err(BrokerError::invalid_configuration("Kafka URL has no brokers"));
        }
        let settings = KafkaSettings::from_config(config)?;
        info!(brokers = ?brokers, "Connecting to Kafka");
        let backend = self.connector.connect(&brokers, &settings, &self.tuning).await?;
        Ok(Arc::new(KafkaSession::new(backend, self.tuning.clone())))
    }

    /// Reload topic names and widen open glob subscriptions to new topics
    pub async fn refresh_topics(&self) -> BrokerResult<Vec<String>> {
        let session = self.session()?;
        let topics = session.refresh_topics().await?;
        session.resubscribe().await?;
        Ok(topics)
    }

    /// Cached topic names from the last refresh
    pub fn topics(&self) -> Vec<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.topics.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BasicClient for KafkaClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Kafka
    }

    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()> {
        self.state.begin_connect()?;
        let result = self.open(config).await;

        match result {
            Ok(session) => {
                *self.session.lock() = Some(session);
                self.state.set(ConnectionState::Connected);
                info!(url = %config.url, "Kafka connected");
                Ok(())
            }
            Err(e) => {
                error!(url = %config.url, error = %e, "Kafka connect failed");
                self.state.set(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.tasks.abort_all();
            session.routes.lock().clear();
            session.backend.close().await;
            info!("Kafka disconnected");
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()> {
        let session = self.session()?;
        let mut headers = message.headers().cloned().unwrap_or_default();
        let key = headers.remove(HEADER_KEY).map(bytes::Bytes::from);
        session
            .backend
            .produce(OutgoingRecord {
                topic: subject.to_string(),
                key,
                payload: message.payload().clone(),
                headers,
            })
            .await?;
        debug!(topic = %subject, bytes = message.size(), "Published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        let session = self.session()?;
        let matcher = TopicMatcher::new(pattern)?;
        if session.topics.lock().is_empty() {
            session.refresh_topics().await?;
        }

        let (tx, rx) = Subscription::channel();
        let id = session.next_route.fetch_add(1, Ordering::Relaxed);
        session.routes.lock().push(Route {
            id,
            pattern: pattern.to_string(),
            matcher,
            tx,
        });
        if let Err(e) = session.resubscribe().await {
            session.remove_route(id);
            return Err(e);
        }
        session.ensure_polling();
        info!(pattern = %pattern, "Kafka subscription started");

        let cancel = Arc::new(KafkaCancel {
            session: Arc::downgrade(&session),
            route: id,
            done: AtomicBool::new(false),
        });
        Ok(Subscription::new(pattern, rx, cancel))
    }

    async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        let session = self.session()?;
        let removed = {
            let mut routes = session.routes.lock();
            let before = routes.len();
            routes.retain(|r| r.pattern != pattern);
            before - routes.len()
        };
        if removed > 0 {
            session.resubscribe().await?;
        }
        debug!(pattern = %pattern, removed, "Kafka unsubscribe");
        Ok(())
    }

    async fn fetch_last(&self, subject: &str, count: usize) -> BrokerResult<Vec<UnifiedMessage>> {
        let session = self.session()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let starts: Vec<(i32, i64)> = session
            .backend
            .watermarks(subject)
            .await?
            .into_iter()
            .filter(|w| !w.is_empty())
            .map(|w| (w.partition, w.tail_start(count)))
            .collect();
        let limit = count.saturating_mul(starts.len().max(1));
        let mut records = session
            .backend
            .read_from(subject, &starts, limit, self.tuning.fetch_last_deadline())
            .await?;

        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.partition.cmp(&b.partition))
                .then(a.offset.cmp(&b.offset))
        });
        let skip = records.len().saturating_sub(count);
        Ok(records.into_iter().skip(skip).map(record_message).collect())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use mq_types::Headers;
    use std::time::Duration;

    async fn connected(log: Arc<MemoryLog>) -> KafkaClient {
        let client = KafkaClient::in_memory(log, &SessionSettings::default());
        client
            .connect(&ConnectionConfig::new("kafka://localhost:9092"))
            .await
            .unwrap();
        client
    }

    async fn next(sub: &mut Subscription<UnifiedMessage>) -> UnifiedMessage {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("no error")
    }

    #[test]
    fn test_record_message_headers() {
        let msg = record_message(LogRecord {
            topic: "orders".into(),
            partition: 2,
            offset: 17,
            key: Some(Bytes::from_static(b"customer-9")),
            payload: Bytes::from_static(b"{}"),
            headers: Headers::new(),
            timestamp: None,
        });
        assert_eq!(msg.subject(), "orders");
        assert_eq!(msg.header(HEADER_PARTITION), Some("2"));
        assert_eq!(msg.header(HEADER_OFFSET), Some("17"));
        assert_eq!(msg.header(HEADER_KEY), Some("customer-9"));
    }

    #[tokio::test]
    async fn test_without_feature_connect_reports_unsupported() {
        let client = KafkaClient::new(Arc::new(UnavailableConnector), &SessionSettings::default());
        let err = client
            .connect(&ConnectionConfig::new("kafka://localhost:9092"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::OperationNotSupported(_)));
        assert!(matches!(client.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_fan_out_to_matching_patterns() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("orders.created", 1);
        log.create_topic("users.created", 1);
        let client = connected(log).await;

        let mut all = client.subscribe(">").await.unwrap();
        let mut orders = client.subscribe("orders.*").await.unwrap();

        client
            .publish(UnifiedMessage::new("", "u1"), "users.created")
            .await
            .unwrap();
        client
            .publish(UnifiedMessage::new("", "o1"), "orders.created")
            .await
            .unwrap();

        assert_eq!(next(&mut all).await.payload(), &Bytes::from_static(b"u1"));
        assert_eq!(next(&mut all).await.payload(), &Bytes::from_static(b"o1"));
        let order = next(&mut orders).await;
        assert_eq!(order.subject(), "orders.created");
        assert_eq!(order.header(HEADER_OFFSET), Some("0"));
    }

    #[tokio::test]
    async fn test_publish_key_header_becomes_record_key() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("payments", 1);
        let client = connected(log).await;
        let mut sub = client.subscribe("payments").await.unwrap();

        client
            .publish(
                UnifiedMessage::new("", "p").with_header(HEADER_KEY, "acct-1"),
                "payments",
            )
            .await
            .unwrap();
        let msg = next(&mut sub).await;
        assert_eq!(msg.header(HEADER_KEY), Some("acct-1"));
    }

    #[tokio::test]
    async fn test_fetch_last_returns_tail() {
        let log = Arc::new(MemoryLog::new());
        let client = connected(log.clone()).await;
        for i in 0..5 {
            client
                .publish(UnifiedMessage::new("", format!("m{}", i)), "audit")
                .await
                .unwrap();
        }
        let last: Vec<String> = client
            .fetch_last("audit", 2)
            .await
            .unwrap()
            .iter()
            .map(|m| m.payload_str().into_owned())
            .collect();
        assert_eq!(last, vec!["m3", "m4"]);
        assert_eq!(log.len("audit"), 5);
    }

    #[tokio::test]
    async fn test_disconnect_ends_subscriptions() {
        let log = Arc::new(MemoryLog::new());
        log.create_topic("orders", 1);
        let client = connected(log).await;
        let mut sub = client.subscribe("orders").await.unwrap();

        client.disconnect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let end = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap();
        assert!(end.is_none());
        assert_eq!(
            client.publish(UnifiedMessage::new("", "x"), "orders").await,
            Err(BrokerError::NotConnected)
        );
    }
}
