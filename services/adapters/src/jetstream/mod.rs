//! # JetStream Adapter
//!
//! Persistent streams on top of the NATS core: stream and consumer
//! management through the `$JS.API` request subjects, persistent publish
//! with broker acknowledgement, pull-based `fetch` and continuous `consume`.
//!
//! When the server answers the `$JS.API.INFO` probe with an error (or not at
//! all) the adapter stays connected as a plain NATS client and every
//! streaming operation fails with `OperationNotSupported`.

pub mod ack;
pub mod api;

pub use ack::{ack_payload, AckReply, JetStreamAcker};

use crate::common::{BasicClient, CancelHandle, StreamingClient, Subscription, SubscriptionSender};
use crate::nats::{new_inbox, unified_message, InboundMessage, NatsConnection, NatsCore, STATUS_NO_RESPONDERS};
use api::{
    AccountInfo, ApiReply, ConsumerConfigDto, ConsumerInfoDto, ConsumerListPage,
    CreateConsumerRequest, DeleteReply, PagedRequest, PubAckDto, PullRequest, StreamConfigDto,
    StreamInfoDto, StreamListPage, StreamNamesPage,
};
use async_trait::async_trait;
use bytes::Bytes;
use mq_config::{ProviderKind, SessionSettings};
use mq_types::{
    AcknowledgeableMessage, Acknowledger, BrokerError, BrokerResult, ConnectionConfig,
    ConnectionState, ConsumerConfig, ConsumerInfo, PublishAck, StreamConfig, StreamInfo,
    UnifiedMessage,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// No messages available for a `no_wait` pull
const STATUS_NO_MESSAGES: u16 = 404;
/// Pull request expired
const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Idle heartbeat / flow control
const STATUS_CONTROL: u16 = 100;

fn validate_name(kind: &str, name: &str) -> BrokerResult<()> {
    if name.is_empty() || name.contains(['.', '*', '>']) || name.contains(char::is_whitespace) {
        return Err(BrokerError::invalid_configuration(format!(
            "invalid {} name '{}'",
            kind, name
        )));
    }
    Ok(())
}

fn json_body<T: Serialize>(body: &T) -> BrokerResult<Bytes> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|e| BrokerError::invalid_configuration(format!("request body: {}", e)))
}

/// One message read from a pull inbox
enum Pulled {
    Message(AcknowledgeableMessage),
    Status(u16, String),
    Skipped,
}

fn classify(message: InboundMessage, acker: &Arc<JetStreamAcker>) -> Pulled {
    if let Some(status) = message.status() {
        if message.payload.is_empty() {
            let description = message
                .headers
                .as_ref()
                .and_then(|h| h.description.clone())
                .unwrap_or_default();
            return Pulled::Status(status, description);
        }
    }

    let Some(reply) = message.reply_to.clone() else {
        warn!(subject = %message.subject, "Pulled message without ack subject");
        return Pulled::Skipped;
    };
    let Some(parsed) = AckReply::parse(&reply) else {
        warn!(subject = %message.subject, reply = %reply, "Unrecognized ack subject");
        return Pulled::Skipped;
    };

    let handle = acker.track(reply);
    let sink: Arc<dyn Acknowledger> = acker.clone();
    Pulled::Message(AcknowledgeableMessage::new(
        unified_message(message),
        parsed.metadata(),
        handle,
        sink,
    ))
}

/// Private inbox receiving the replies of pull requests
struct PullInbox {
    subject: String,
    sid: u64,
    rx: mpsc::UnboundedReceiver<BrokerResult<InboundMessage>>,
}

impl PullInbox {
    fn open(connection: &NatsConnection) -> BrokerResult<Self> {
        let subject = new_inbox();
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = connection.subscribe(&subject, Box::new(move |item| tx.send(item).is_ok()))?;
        Ok(Self { subject, sid, rx })
    }
}

/// Parameters of one pull loop
#[derive(Debug, Clone)]
struct PullTarget {
    next_subject: String,
    batch: usize,
    expires: Duration,
    grace: Duration,
}

impl PullTarget {
    fn deadline(&self) -> Instant {
        Instant::now() + self.expires + self.grace
    }
}

struct ConsumeCancel {
    connection: Weak<NatsConnection>,
    sid: u64,
    task: AbortHandle,
    done: AtomicBool,
}

impl CancelHandle for ConsumeCancel {
    fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
        if let Some(connection) = self.connection.upgrade() {
            connection.unsubscribe_sid(self.sid);
        }
    }
}

/// JetStream provider; also usable as a plain NATS client
pub struct JetStreamClient {
    core: NatsCore,
    streaming: AtomicBool,
    acker: Mutex<Option<Arc<JetStreamAcker>>>,
    consumes: Mutex<HashMap<(String, String), Arc<dyn CancelHandle>>>,
}

impl fmt::Debug for JetStreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JetStreamClient")
            .field("core", &self.core)
            .field("streaming", &self.is_streaming_available())
            .field("consumes", &self.consumes.lock().len())
            .finish()
    }
}

impl JetStreamClient {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            core: NatsCore::new(ProviderKind::JetStream, settings),
            streaming: AtomicBool::new(false),
            acker: Mutex::new(None),
            consumes: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_streaming(&self) -> BrokerResult<()> {
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(BrokerError::not_supported(
                "JetStream is not available on this connection",
            ));
        }
        Ok(())
    }

    fn acker(&self) -> BrokerResult<Arc<JetStreamAcker>> {
        self.acker.lock().clone().ok_or(BrokerError::NotConnected)
    }

    async fn raw_api<T: DeserializeOwned>(&self, tail: &str, body: Bytes) -> BrokerResult<ApiReply<T>> {
        let subject = api::subject(tail);
        let reply = self
            .core
            .connection()?
            .request(&subject, None, &body, self.core.timeouts().request())
            .await?;
        if reply.status() == Some(STATUS_NO_RESPONDERS) {
            return Err(BrokerError::not_supported(format!(
                "no JetStream responders for {}",
                subject
            )));
        }
        api::decode(&reply.payload)
    }

    async fn api<T: DeserializeOwned>(&self, tail: &str, body: Bytes) -> BrokerResult<ApiReply<T>> {
        self.ensure_streaming()?;
        self.raw_api(tail, body).await
    }

    /// `$JS.API.INFO`; any failure leaves the adapter in basic mode
    async fn probe(&self) -> bool {
        match self.raw_api::<AccountInfo>("INFO", Bytes::new()).await {
            Ok(ApiReply::Ok(account)) => {
                info!(streams = account.streams, consumers = account.consumers, "JetStream available");
                true
            }
            Ok(ApiReply::Err(err)) => {
                warn!(code = err.code, description = %err.description, "JetStream disabled for account, continuing as basic NATS");
                false
            }
            Err(e) => {
                warn!(error = %e, "JetStream probe failed, continuing as basic NATS");
                false
            }
        }
    }

    /// Names of every stream, following the API's paging
    pub async fn stream_names(&self) -> BrokerResult<Vec<String>> {
        let mut names = Vec::new();
        loop {
            let page: StreamNamesPage = self
                .api("STREAM.NAMES", json_body(&PagedRequest { offset: names.len() })?)
                .await?
                .into_result()?;
            let batch = page.streams.unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            names.extend(batch);
            if names.len() >= page.total {
                break;
            }
        }
        Ok(names)
    }

    fn stop_consume(&self, stream: &str, consumer: &str) {
        let previous = self
            .consumes
            .lock()
            .remove(&(stream.to_string(), consumer.to_string()));
        if let Some(previous) = previous {
            debug!(stream = %stream, consumer = %consumer, "Stopping previous consume");
            previous.cancel();
        }
    }

    fn stop_all_consumes(&self) {
        let running: Vec<_> = self.consumes.lock().drain().map(|(_, c)| c).collect();
        for cancel in running {
            cancel.cancel();
        }
    }

    fn pull_target(&self, stream: &str, consumer: &str, batch: usize, expires: Duration) -> PullTarget {
        let expires_or_request = if expires.is_zero() {
            self.core.timeouts().request()
        } else {
            expires
        };
        PullTarget {
            next_subject: api::subject(&format!("CONSUMER.MSG.NEXT.{}.{}", stream, consumer)),
            batch: batch.max(1),
            expires: expires_or_request,
            grace: self.core.timeouts().fetch_grace(),
        }
    }
}

fn send_pull(
    connection: &NatsConnection,
    target: &PullTarget,
    inbox: &str,
    wire_expires: Duration,
) -> BrokerResult<()> {
    let body = json_body(&PullRequest::new(target.batch, wire_expires))?;
    connection.publish(&target.next_subject, Some(inbox), None, &body)
}

async fn consume_loop(
    connection: Weak<NatsConnection>,
    mut inbox: PullInbox,
    target: PullTarget,
    acker: Arc<JetStreamAcker>,
    tx: SubscriptionSender<AcknowledgeableMessage>,
) {
    loop {
        let Some(conn) = connection.upgrade() else {
            return;
        };
        if let Err(e) = send_pull(&conn, &target, &inbox.subject, target.expires) {
            let _ = tx.send(Err(e));
            return;
        }
        drop(conn);

        let deadline = target.deadline();
        let mut received = 0usize;
        while received < target.batch {
            let message = match timeout_at(deadline, inbox.rx.recv()).await {
                Err(_) => break,
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(e));
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };
            match classify(message, &acker) {
                Pulled::Message(message) => {
                    received += 1;
                    if tx.send(Ok(message)).is_err() {
                        return;
                    }
                }
                Pulled::Status(STATUS_CONTROL, _) | Pulled::Skipped => {}
                Pulled::Status(STATUS_NO_MESSAGES | STATUS_REQUEST_TIMEOUT, _) => break,
                Pulled::Status(code, description) => {
                    warn!(code, description = %description, subject = %target.next_subject, "Consume terminated by server");
                    let _ = tx.send(Err(BrokerError::subscription_failed(format!(
                        "pull consumer status {}: {}",
                        code, description
                    ))));
                    return;
                }
            }
        }
        debug!(received, subject = %target.next_subject, "Pull batch drained");
    }
}

#[async_trait]
impl BasicClient for JetStreamClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::JetStream
    }

    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()> {
        self.core.connect(config).await?;
        let connection = self.core.connection()?;
        *self.acker.lock() = Some(Arc::new(JetStreamAcker::new(Arc::downgrade(&connection))));
        let available = self.probe().await;
        self.streaming.store(available, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.stop_all_consumes();
        self.streaming.store(false, Ordering::SeqCst);
        if let Some(acker) = self.acker.lock().take() {
            acker.clear();
        }
        self.core.disconnect().await
    }

    async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()> {
        self.core.publish(&message, subject)
    }

    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        self.core.subscribe(pattern)
    }

    async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        self.core.unsubscribe(pattern)
    }

    async fn request(
        &self,
        message: UnifiedMessage,
        subject: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<UnifiedMessage>> {
        self.core.request(&message, subject, timeout).await
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.core.state_changes()
    }
}

#[async_trait]
impl StreamingClient for JetStreamClient {
    fn as_basic(self: Arc<Self>) -> Arc<dyn BasicClient> {
        self
    }

    fn is_streaming_available(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    async fn list_streams(&self) -> BrokerResult<Vec<StreamInfo>> {
        let mut streams: Vec<StreamInfo> = Vec::new();
        loop {
            let page: StreamListPage = self
                .api("STREAM.LIST", json_body(&PagedRequest { offset: streams.len() })?)
                .await?
                .into_result()?;
            let batch = page.streams.unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            streams.extend(batch.into_iter().map(StreamInfo::from));
            if streams.len() >= page.total {
                break;
            }
        }
        Ok(streams)
    }

    async fn create_stream(&self, config: StreamConfig) -> BrokerResult<StreamInfo> {
        validate_name("stream", &config.name)?;
        let body = json_body(&StreamConfigDto::from(&config))?;
        let info: StreamInfoDto = self
            .api(&format!("STREAM.CREATE.{}", config.name), body)
            .await?
            .into_result()?;
        info!(stream = %config.name, subjects = ?config.subjects, "Stream created");
        Ok(info.into())
    }

    async fn delete_stream(&self, name: &str) -> BrokerResult<()> {
        validate_name("stream", name)?;
        let reply: DeleteReply = self
            .api(&format!("STREAM.DELETE.{}", name), Bytes::new())
            .await?
            .into_result()?;
        if !reply.success {
            return Err(BrokerError::provider(format!("stream '{}' was not deleted", name)));
        }
        info!(stream = %name, "Stream deleted");
        Ok(())
    }

    async fn stream_info(&self, name: &str) -> BrokerResult<Option<StreamInfo>> {
        validate_name("stream", name)?;
        let info: Option<StreamInfoDto> = self
            .api(&format!("STREAM.INFO.{}", name), Bytes::new())
            .await?
            .into_option()?;
        Ok(info.map(StreamInfo::from))
    }

    async fn list_consumers(&self, stream: &str) -> BrokerResult<Vec<ConsumerInfo>> {
        validate_name("stream", stream)?;
        let mut consumers: Vec<ConsumerInfo> = Vec::new();
        loop {
            let page: ConsumerListPage = self
                .api(
                    &format!("CONSUMER.LIST.{}", stream),
                    json_body(&PagedRequest { offset: consumers.len() })?,
                )
                .await?
                .into_result()?;
            let batch = page.consumers.unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            consumers.extend(batch.into_iter().map(ConsumerInfo::from));
            if consumers.len() >= page.total {
                break;
            }
        }
        Ok(consumers)
    }

    async fn create_consumer(&self, stream: &str, config: ConsumerConfig) -> BrokerResult<ConsumerInfo> {
        validate_name("stream", stream)?;
        let tail = if config.durable {
            validate_name("consumer", &config.name)?;
            format!("CONSUMER.DURABLE.CREATE.{}.{}", stream, config.name)
        } else {
            format!("CONSUMER.CREATE.{}", stream)
        };
        let body = json_body(&CreateConsumerRequest {
            stream_name: stream.to_string(),
            config: ConsumerConfigDto::from(&config),
        })?;
        let info: ConsumerInfoDto = self.api(&tail, body).await?.into_result()?;
        info!(stream = %stream, consumer = %info.name, durable = config.durable, "Consumer created");
        Ok(info.into())
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> BrokerResult<()> {
        validate_name("stream", stream)?;
        validate_name("consumer", consumer)?;
        self.stop_consume(stream, consumer);
        let reply: DeleteReply = self
            .api(&format!("CONSUMER.DELETE.{}.{}", stream, consumer), Bytes::new())
            .await?
            .into_result()?;
        if !reply.success {
            return Err(BrokerError::provider(format!(
                "consumer '{}' on '{}' was not deleted",
                consumer, stream
            )));
        }
        info!(stream = %stream, consumer = %consumer, "Consumer deleted");
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> BrokerResult<Option<ConsumerInfo>> {
        validate_name("stream", stream)?;
        validate_name("consumer", consumer)?;
        let info: Option<ConsumerInfoDto> = self
            .api(&format!("CONSUMER.INFO.{}.{}", stream, consumer), Bytes::new())
            .await?
            .into_option()?;
        Ok(info.map(ConsumerInfo::from))
    }

    async fn publish_persistent(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<PublishAck> {
        self.ensure_streaming()?;
        let reply = self
            .core
            .connection()?
            .request(subject, message.headers(), message.payload(), self.core.timeouts().request())
            .await?;
        if reply.status() == Some(STATUS_NO_RESPONDERS) {
            return Err(BrokerError::publish_failed(format!(
                "no stream captures subject '{}'",
                subject
            )));
        }
        let ack: PubAckDto = api::decode(&reply.payload)?.into_result()?;
        debug!(subject = %subject, stream = %ack.stream, seq = ack.seq, duplicate = ack.duplicate, "Persistent publish acknowledged");
        Ok(ack.into())
    }

    async fn consume(&self, stream: &str, consumer: &str) -> BrokerResult<Subscription<AcknowledgeableMessage>> {
        let info = self
            .consumer_info(stream, consumer)
            .await?
            .ok_or_else(|| {
                BrokerError::subscription_failed(format!(
                    "consumer '{}' not found on stream '{}'",
                    consumer, stream
                ))
            })?;
        self.stop_consume(stream, consumer);

        let connection = self.core.connection()?;
        let acker = self.acker()?;
        let settings = self.core.settings();
        let target = self.pull_target(stream, consumer, settings.pull_batch, settings.pull_expires());
        let inbox = PullInbox::open(&connection)?;
        let sid = inbox.sid;

        let (tx, rx) = Subscription::channel();
        let task = tokio::spawn(consume_loop(
            Arc::downgrade(&connection),
            inbox,
            target,
            acker,
            tx,
        ));
        let cancel: Arc<dyn CancelHandle> = Arc::new(ConsumeCancel {
            connection: Arc::downgrade(&connection),
            sid,
            task: task.abort_handle(),
            done: AtomicBool::new(false),
        });
        self.consumes
            .lock()
            .insert((stream.to_string(), consumer.to_string()), cancel.clone());

        info!(
            stream = %stream,
            consumer = %consumer,
            filter = info.config.filter_subject.as_deref().unwrap_or(">"),
            "Consume started"
        );
        Ok(Subscription::new(format!("{}/{}", stream, consumer), rx, cancel))
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        expires: Duration,
    ) -> BrokerResult<Vec<AcknowledgeableMessage>> {
        self.ensure_streaming()?;
        validate_name("stream", stream)?;
        validate_name("consumer", consumer)?;
        let connection = self.core.connection()?;
        let acker = self.acker()?;
        let target = self.pull_target(stream, consumer, batch, expires);

        let mut inbox = PullInbox::open(&connection)?;
        if let Err(e) = send_pull(&connection, &target, &inbox.subject, expires) {
            connection.unsubscribe_sid(inbox.sid);
            return Err(e);
        }

        let deadline = target.deadline();
        let mut messages = Vec::new();
        let mut outcome = Ok(());
        while messages.len() < target.batch {
            let message = match timeout_at(deadline, inbox.rx.recv()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Err(e))) => {
                    outcome = Err(e);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };
            match classify(message, &acker) {
                Pulled::Message(message) => messages.push(message),
                Pulled::Status(STATUS_CONTROL, _) | Pulled::Skipped => {}
                Pulled::Status(STATUS_NO_MESSAGES | STATUS_REQUEST_TIMEOUT, _) => break,
                Pulled::Status(code, description) => {
                    outcome = Err(BrokerError::provider(format!(
                        "pull request failed with status {}: {}",
                        code, description
                    )));
                    break;
                }
            }
        }
        connection.unsubscribe_sid(inbox.sid);

        match outcome {
            Ok(()) => {
                debug!(stream = %stream, consumer = %consumer, count = messages.len(), "Fetch complete");
                Ok(messages)
            }
            Err(e) => {
                for message in &messages {
                    message.release();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::NatsHeaders;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("stream", "ORDERS").is_ok());
        assert!(validate_name("stream", "").is_err());
        assert!(validate_name("stream", "ORD.ERS").is_err());
        assert!(validate_name("consumer", "tap *").is_err());
        assert!(validate_name("consumer", "a>").is_err());
    }

    #[tokio::test]
    async fn test_streaming_ops_before_connect() {
        let client = JetStreamClient::new(&SessionSettings::default());
        assert!(!client.is_streaming_available());
        assert!(matches!(
            client.list_streams().await,
            Err(BrokerError::OperationNotSupported(_))
        ));
        assert!(matches!(
            client.fetch("ORDERS", "tap", 5, Duration::from_millis(200)).await,
            Err(BrokerError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_classify_status_and_message() {
        let acker = Arc::new(JetStreamAcker::new(Weak::new()));
        let status = InboundMessage {
            subject: "_INBOX.x".into(),
            sid: 1,
            reply_to: None,
            headers: Some(NatsHeaders {
                status: Some(408),
                description: Some("Request Timeout".into()),
                ..NatsHeaders::default()
            }),
            payload: Bytes::new(),
        };
        assert!(matches!(classify(status, &acker), Pulled::Status(408, d) if d == "Request Timeout"));

        let data = InboundMessage {
            subject: "orders.created".into(),
            sid: 1,
            reply_to: Some("$JS.ACK.ORDERS.tap.1.12.3.1709287200000000000.4".into()),
            headers: None,
            payload: Bytes::from_static(b"{\"id\":1}"),
        };
        match classify(data, &acker) {
            Pulled::Message(message) => {
                assert_eq!(message.message().subject(), "orders.created");
                assert_eq!(message.metadata().stream_sequence, 12);
                assert_eq!(message.metadata().pending, 4);
                assert_eq!(acker.pending_count(), 1);
            }
            _ => panic!("expected a message"),
        }

        let stray = InboundMessage {
            subject: "orders.created".into(),
            sid: 1,
            reply_to: None,
            headers: None,
            payload: Bytes::from_static(b"x"),
        };
        assert!(matches!(classify(stray, &acker), Pulled::Skipped));
    }
}
