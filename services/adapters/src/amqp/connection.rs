//! AMQP connection: handshake, I/O tasks and channel-level operations
//!
//! After the handshake the stream is split. A receive task feeds the
//! resumable decoder and dispatches frames through [`Tables`]; a single
//! writer task owns the write half and emits pre-encoded buffers in queue
//! order, so the frames of one publish never interleave with other frames.

use super::dispatch::{ConsumerSlot, Flow, RpcError, Tables, PUBLISH_CHANNEL};
use super::subject::{publish_properties, AmqpTarget};
use crate::common::{spawn_detached, CancelHandle, StateNotifier, Subscription, TaskSet};
use bytes::Bytes;
use futures::future::join_all;
use mq_codec::constants::{reply, DEFAULT_CHANNEL_MAX, FRAME_MAX_CEILING};
use mq_codec::{encode_publish, FieldTable, FieldValue, Frame, FrameDecoder, Method, PROTOCOL_HEADER};
use mq_config::TimeoutSettings;
use mq_types::{BrokerError, BrokerResult, ConnectionState, UnifiedMessage};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const CLOSE_OK_WAIT: Duration = Duration::from_secs(1);

/// Everything the handshake and the channel operations need
#[derive(Clone)]
pub struct AmqpParams {
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub heartbeat: u16,
    pub prefetch: u16,
    pub client_name: String,
    pub timeouts: TimeoutSettings,
}

impl fmt::Debug for AmqpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpParams")
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("heartbeat", &self.heartbeat)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

/// Limits agreed during Connection.Tune
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Tuning {
    /// Clamp the server's proposal to what this client accepts
    ///
    /// 0 means "no limit" for channel-max and frame-max. For heartbeats the
    /// lower non-zero value wins; 0 from one side defers to the other.
    pub fn negotiate(channel_max: u16, frame_max: u32, server_heartbeat: u16, client_heartbeat: u16) -> Self {
        let channel_max = if channel_max == 0 {
            DEFAULT_CHANNEL_MAX
        } else {
            channel_max
        };
        let frame_max = if frame_max == 0 {
            FRAME_MAX_CEILING
        } else {
            frame_max.min(FRAME_MAX_CEILING)
        };
        let heartbeat = match (server_heartbeat, client_heartbeat) {
            (0, client) => client,
            (server, 0) => server,
            (server, client) => server.min(client),
        };
        Self {
            channel_max,
            frame_max,
            heartbeat,
        }
    }
}

// ============================================================================
// SHARED LINK STATE
// ============================================================================

/// State shared between the connection object and its I/O tasks
struct Link {
    tables: Mutex<Tables>,
    state: Arc<StateNotifier>,
    closing: AtomicBool,
}

impl Link {
    /// Connection is gone: end all waiters, report unless we closed it
    fn fail(&self, reason: &str) {
        let first = {
            let mut tables = self.tables.lock();
            let first = !tables.is_closed();
            tables.fail_all(reason);
            first
        };
        if !first || self.closing.load(Ordering::SeqCst) {
            debug!(reason, "AMQP connection finished");
            return;
        }
        error!(reason, "AMQP connection failed");
        self.state.set(ConnectionState::Error(reason.to_string()));
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct AmqpConnection {
    link: Arc<Link>,
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: TaskSet,
    tuning: Tuning,
    params: AmqpParams,
    publish_gate: tokio::sync::Mutex<()>,
}

impl fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("vhost", &self.params.vhost)
            .field("tuning", &self.tuning)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl AmqpConnection {
    /// Run the handshake on `stream`, start the I/O tasks and open the publish channel
    pub async fn open<S>(
        mut stream: S,
        params: AmqpParams,
        state: Arc<StateNotifier>,
    ) -> BrokerResult<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut decoder = FrameDecoder::new();
        let tuning = handshake(&mut stream, &mut decoder, &params).await?;
        decoder.set_max_frame_size(tuning.frame_max);
        info!(
            vhost = %params.vhost,
            channel_max = tuning.channel_max,
            frame_max = tuning.frame_max,
            heartbeat = tuning.heartbeat,
            "AMQP handshake complete"
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Bytes>();
        let link = Arc::new(Link {
            tables: Mutex::new(Tables::new()),
            state,
            closing: AtomicBool::new(false),
        });

        let tasks = TaskSet::new();
        tasks.spawn(write_loop(write_half, writer_rx, link.clone()));
        tasks.spawn(read_loop(
            read_half,
            decoder,
            link.clone(),
            writer_tx.clone(),
            tuning.heartbeat,
        ));
        if tuning.heartbeat > 0 {
            let every = Duration::from_millis(u64::from(tuning.heartbeat) * 500);
            tasks.spawn(heartbeat_loop(writer_tx.clone(), every));
        }

        // Dropping `connection` on error aborts the tasks and releases the stream
        let connection = Arc::new(Self {
            link,
            writer: writer_tx,
            tasks,
            tuning,
            params,
            publish_gate: tokio::sync::Mutex::new(()),
        });
        connection.open_channel(PUBLISH_CHANNEL).await?;
        connection.link.tables.lock().mark_publish_channel_open();
        Ok(connection)
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub fn is_closed(&self) -> bool {
        self.link.tables.lock().is_closed()
    }

    fn send(&self, bytes: Bytes) -> BrokerResult<()> {
        self.writer.send(bytes).map_err(|_| BrokerError::NotConnected)
    }

    /// Send `method` on `channel` and wait for the broker's reply
    async fn rpc(&self, channel: u16, method: Method) -> Result<Method, RpcError> {
        let name = method.name();
        let bytes = Frame::method(channel, method)
            .encode()
            .map_err(BrokerError::from)?;

        let (tx, rx) = oneshot::channel();
        self.link.tables.lock().begin_rpc(channel, tx)?;
        if let Err(e) = self.send(bytes) {
            self.link.tables.lock().abandon_rpc(channel);
            return Err(e.into());
        }

        match timeout(self.params.timeouts.rpc(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::connection_failed("connection closed").into()),
            Err(_) => {
                self.link.tables.lock().abandon_rpc(channel);
                warn!(channel, method = name, "AMQP RPC timed out");
                Err(BrokerError::Timeout.into())
            }
        }
    }

    async fn open_channel(&self, channel: u16) -> Result<(), RpcError> {
        match self.rpc(channel, Method::ChannelOpen).await? {
            Method::ChannelOpenOk => {
                debug!(channel, "Channel open");
                Ok(())
            }
            other => Err(unexpected_reply("Channel.OpenOk", &other)),
        }
    }

    /// Close a channel we opened; the slot is released whatever the outcome
    async fn close_channel(&self, channel: u16) {
        if !self.link.tables.lock().is_open(channel) {
            return;
        }
        let result = self
            .rpc(
                channel,
                Method::ChannelClose {
                    reply_code: reply::SUCCESS,
                    reply_text: "Normal shutdown".to_string(),
                    class_id: 0,
                    method_id: 0,
                },
            )
            .await;
        match result {
            Ok(Method::ChannelCloseOk) => debug!(channel, "Channel closed"),
            Ok(other) => warn!(channel, reply = other.name(), "Unexpected reply to Channel.Close"),
            Err(e) => debug!(channel, error = ?e, "Channel close failed"),
        }
        self.link.tables.lock().release_channel(channel);
    }

    async fn ensure_publish_channel(&self) -> BrokerResult<()> {
        {
            let tables = self.link.tables.lock();
            if tables.is_closed() {
                return Err(BrokerError::NotConnected);
            }
            if tables.publish_channel_open() {
                return Ok(());
            }
        }
        info!("Reopening publish channel");
        self.open_channel(PUBLISH_CHANNEL).await?;
        self.link.tables.lock().mark_publish_channel_open();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub async fn publish(&self, message: &UnifiedMessage, subject: &str) -> BrokerResult<()> {
        let target = AmqpTarget::parse(subject)?;
        let _gate = self.publish_gate.lock().await;
        self.ensure_publish_channel().await?;

        let bytes = encode_publish(
            PUBLISH_CHANNEL,
            &target.exchange,
            &target.routing_key,
            publish_properties(message),
            message.payload(),
            self.tuning.frame_max,
        )
        .map_err(|e| BrokerError::publish_failed(e.to_string()))?;
        self.send(bytes)?;

        debug!(
            exchange = %target.exchange,
            routing_key = %target.routing_key,
            bytes = message.size(),
            "Published"
        );
        Ok(())
    }

    pub async fn declare_exchange(&self, name: &str, kind: &str, durable: bool) -> BrokerResult<()> {
        let _gate = self.publish_gate.lock().await;
        self.ensure_publish_channel().await?;
        let reply = self
            .rpc(
                PUBLISH_CHANNEL,
                Method::ExchangeDeclare {
                    exchange: name.to_string(),
                    kind: kind.to_string(),
                    passive: false,
                    durable,
                    auto_delete: false,
                    internal: false,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
            )
            .await?;
        match reply {
            Method::ExchangeDeclareOk => {
                info!(exchange = %name, kind = %kind, durable, "Exchange declared");
                Ok(())
            }
            other => Err(unexpected_reply("Exchange.DeclareOk", &other).into()),
        }
    }

    /// Reserve and open a fresh subscription channel
    async fn subscription_channel(&self) -> BrokerResult<u16> {
        let channel = self
            .link
            .tables
            .lock()
            .allocate_channel(self.tuning.channel_max)?;
        if let Err(e) = self.open_channel(channel).await {
            self.link.tables.lock().release_channel(channel);
            return Err(e.into());
        }
        Ok(channel)
    }

    async fn declare_queue(&self, channel: u16, queue: &str, passive: bool, exclusive: bool) -> Result<String, RpcError> {
        let reply = self
            .rpc(
                channel,
                Method::QueueDeclare {
                    queue: queue.to_string(),
                    passive,
                    durable: false,
                    exclusive,
                    auto_delete: true,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
            )
            .await?;
        match reply {
            Method::QueueDeclareOk { queue, .. } => Ok(queue),
            other => Err(unexpected_reply("Queue.DeclareOk", &other)),
        }
    }

    pub async fn subscribe(self: &Arc<Self>, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        let target = AmqpTarget::parse(pattern)?;
        let suffix = Uuid::new_v4().simple().to_string();
        let queue = target.queue_name(&suffix[..8]);
        let exclusive = !target.is_default_exchange();

        let mut channel = self.subscription_channel().await?;
        let queue = match self.declare_queue(channel, &queue, false, exclusive).await {
            Ok(queue) => queue,
            Err(RpcError::ChannelClosed {
                reply_code: reply::PRECONDITION_FAILED,
                reply_text,
            }) => {
                info!(queue = %queue, reason = %reply_text, "Queue exists with other arguments, declaring passively");
                channel = self.subscription_channel().await?;
                match self.declare_queue(channel, &queue, true, false).await {
                    Ok(queue) => queue,
                    Err(e) => return Err(self.abort_subscribe(channel, e).await),
                }
            }
            Err(e) => return Err(self.abort_subscribe(channel, e).await),
        };

        if !target.is_default_exchange() {
            let bound = self
                .rpc(
                    channel,
                    Method::QueueBind {
                        queue: queue.clone(),
                        exchange: target.exchange.clone(),
                        routing_key: target.routing_key.clone(),
                        no_wait: false,
                        arguments: FieldTable::new(),
                    },
                )
                .await;
            match bound {
                Ok(Method::QueueBindOk) => {}
                Ok(other) => {
                    return Err(self
                        .abort_subscribe(channel, unexpected_reply("Queue.BindOk", &other))
                        .await)
                }
                Err(e) => return Err(self.abort_subscribe(channel, e).await),
            }
        }

        if self.params.prefetch > 0 {
            let qos = self
                .rpc(
                    channel,
                    Method::BasicQos {
                        prefetch_size: 0,
                        prefetch_count: self.params.prefetch,
                        global: false,
                    },
                )
                .await;
            match qos {
                Ok(Method::BasicQosOk) => {}
                Ok(other) => {
                    return Err(self
                        .abort_subscribe(channel, unexpected_reply("Basic.QosOk", &other))
                        .await)
                }
                Err(e) => return Err(self.abort_subscribe(channel, e).await),
            }
        }

        // Register before consuming so the first delivery finds its slot
        let consumer_tag = format!("mq-{}", Uuid::new_v4());
        let (tx, rx) = Subscription::channel();
        self.link.tables.lock().add_consumer(
            consumer_tag.clone(),
            ConsumerSlot {
                channel,
                pattern: pattern.to_string(),
                sender: tx,
            },
        );

        let consumed = self
            .rpc(
                channel,
                Method::BasicConsume {
                    queue: queue.clone(),
                    consumer_tag: consumer_tag.clone(),
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    no_wait: false,
                    arguments: FieldTable::new(),
                },
            )
            .await;
        match consumed {
            Ok(Method::BasicConsumeOk { .. }) => {}
            Ok(other) => {
                self.link.tables.lock().remove_consumer(&consumer_tag);
                return Err(self
                    .abort_subscribe(channel, unexpected_reply("Basic.ConsumeOk", &other))
                    .await);
            }
            Err(e) => {
                self.link.tables.lock().remove_consumer(&consumer_tag);
                return Err(self.abort_subscribe(channel, e).await);
            }
        }

        info!(
            pattern = %pattern,
            queue = %queue,
            channel,
            consumer_tag = %consumer_tag,
            "AMQP subscription started"
        );
        let cancel = Arc::new(AmqpCancel {
            connection: Arc::downgrade(self),
            channel,
            consumer_tag,
            done: AtomicBool::new(false),
        });
        Ok(Subscription::new(pattern, rx, cancel))
    }

    async fn abort_subscribe(&self, channel: u16, err: RpcError) -> BrokerError {
        self.close_channel(channel).await;
        match BrokerError::from(err) {
            e @ (BrokerError::NotConnected | BrokerError::Timeout | BrokerError::ConnectionFailed(_)) => e,
            other => BrokerError::subscription_failed(other.to_string()),
        }
    }

    /// Basic.Cancel then Channel.Close, both best-effort
    async fn cancel_consumer(&self, channel: u16, consumer_tag: &str) {
        if self.is_closed() {
            return;
        }
        let cancelled = self
            .rpc(
                channel,
                Method::BasicCancel {
                    consumer_tag: consumer_tag.to_string(),
                    no_wait: false,
                },
            )
            .await;
        match cancelled {
            Ok(Method::BasicCancelOk { .. }) => debug!(channel, consumer_tag, "Consumer cancelled"),
            Ok(other) => warn!(channel, reply = other.name(), "Unexpected reply to Basic.Cancel"),
            Err(e) => warn!(channel, consumer_tag, error = ?e, "Basic.Cancel failed"),
        }
        self.close_channel(channel).await;
    }

    pub async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        let consumers = self.link.tables.lock().take_consumers_for(pattern);
        if consumers.is_empty() {
            debug!(pattern = %pattern, "No AMQP subscription to cancel");
            return Ok(());
        }
        let cancels = consumers
            .into_iter()
            .map(|(tag, slot)| async move {
                drop(slot.sender);
                self.cancel_consumer(slot.channel, &tag).await;
            });
        join_all(cancels).await;
        info!(pattern = %pattern, "AMQP subscription cancelled");
        Ok(())
    }

    /// Close all channels, then the connection, within `budget`
    pub async fn close(&self, budget: Duration) {
        self.link.closing.store(true, Ordering::SeqCst);

        let channels = {
            let tables = self.link.tables.lock();
            if tables.is_closed() {
                Vec::new()
            } else {
                tables.open_channels()
            }
        };
        if !channels.is_empty() {
            let closes = channels.into_iter().map(|channel| self.close_channel(channel));
            if timeout(budget, join_all(closes)).await.is_err() {
                warn!("Timed out closing AMQP channels");
            }
        }

        if !self.is_closed() {
            let (tx, rx) = oneshot::channel();
            self.link.tables.lock().expect_close_ok(tx);
            let close = Frame::method(
                0,
                Method::ConnectionClose {
                    reply_code: reply::SUCCESS,
                    reply_text: "Normal shutdown".to_string(),
                    class_id: 0,
                    method_id: 0,
                },
            )
            .encode();
            let sent = match close {
                Ok(bytes) => self.send(bytes).is_ok(),
                Err(_) => false,
            };
            if !sent {
                debug!("Connection.Close could not be sent");
            } else if timeout(budget.min(CLOSE_OK_WAIT), rx).await.is_err() {
                debug!("No Connection.CloseOk from broker");
            }
        }

        self.link.fail("connection closed by client");
        self.tasks.abort_all();
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        self.link.closing.store(true, Ordering::SeqCst);
    }
}

fn unexpected_reply(expected: &str, got: &Method) -> RpcError {
    RpcError::Broker(BrokerError::provider(format!(
        "expected {} but broker sent {}",
        expected,
        got.name()
    )))
}

// ============================================================================
// SUBSCRIPTION CANCELLATION
// ============================================================================

struct AmqpCancel {
    connection: Weak<AmqpConnection>,
    channel: u16,
    consumer_tag: String,
    done: AtomicBool,
}

impl CancelHandle for AmqpCancel {
    fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        // Already detached by unsubscribe or a broker-side close
        if connection
            .link
            .tables
            .lock()
            .remove_consumer(&self.consumer_tag)
            .is_none()
        {
            return;
        }
        let channel = self.channel;
        let tag = self.consumer_tag.clone();
        spawn_detached(async move {
            connection.cancel_consumer(channel, &tag).await;
        });
    }
}

// ============================================================================
// HANDSHAKE
// ============================================================================

fn client_properties(params: &AmqpParams) -> FieldTable {
    let mut capabilities = FieldTable::new();
    capabilities.insert("consumer_cancel_notify".into(), FieldValue::Bool(true));
    capabilities.insert("connection.blocked".into(), FieldValue::Bool(true));

    let mut properties = FieldTable::new();
    properties.insert("product".into(), FieldValue::string("mqtap"));
    properties.insert("version".into(), FieldValue::string(env!("CARGO_PKG_VERSION")));
    properties.insert("platform".into(), FieldValue::string("Rust"));
    properties.insert("connection_name".into(), FieldValue::string(params.client_name.as_str()));
    properties.insert("capabilities".into(), FieldValue::Table(capabilities));
    properties
}

fn plain_credentials(username: &str, password: &str) -> Vec<u8> {
    let mut response = Vec::with_capacity(username.len() + password.len() + 2);
    response.push(0);
    response.extend_from_slice(username.as_bytes());
    response.push(0);
    response.extend_from_slice(password.as_bytes());
    response
}

async fn handshake<S>(stream: &mut S, decoder: &mut FrameDecoder, params: &AmqpParams) -> BrokerResult<Tuning>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let step = params.timeouts.handshake();

    write_step(stream, Bytes::from_static(&PROTOCOL_HEADER), step, "protocol header").await?;

    match read_step(stream, decoder, step, "Connection.Start").await? {
        Method::ConnectionStart {
            version_major,
            version_minor,
            mechanisms,
            ..
        } => {
            if (version_major, version_minor) != (0, 9) {
                return Err(BrokerError::connection_failed(format!(
                    "unsupported AMQP version {}.{}",
                    version_major, version_minor
                )));
            }
            if !mechanisms.split_whitespace().any(|m| m == "PLAIN") {
                return Err(BrokerError::connection_failed(format!(
                    "broker does not offer PLAIN authentication (offers: {})",
                    mechanisms
                )));
            }
        }
        other => return Err(handshake_mismatch("Connection.Start", other)),
    }

    let start_ok = Method::ConnectionStartOk {
        client_properties: client_properties(params),
        mechanism: "PLAIN".to_string(),
        response: plain_credentials(&params.username, &params.password),
        locale: "en_US".to_string(),
    };
    write_step(stream, Frame::method(0, start_ok).encode()?, step, "Connection.StartOk").await?;

    let tuning = match read_step(stream, decoder, step, "Connection.Tune").await? {
        Method::ConnectionTune {
            channel_max,
            frame_max,
            heartbeat,
        } => Tuning::negotiate(channel_max, frame_max, heartbeat, params.heartbeat),
        other => return Err(handshake_mismatch("Connection.Tune", other)),
    };

    let tune_ok = Method::ConnectionTuneOk {
        channel_max: tuning.channel_max,
        frame_max: tuning.frame_max,
        heartbeat: tuning.heartbeat,
    };
    write_step(stream, Frame::method(0, tune_ok).encode()?, step, "Connection.TuneOk").await?;

    let open = Method::ConnectionOpen {
        virtual_host: params.vhost.clone(),
    };
    write_step(stream, Frame::method(0, open).encode()?, step, "Connection.Open").await?;

    match read_step(stream, decoder, step, "Connection.OpenOk").await? {
        Method::ConnectionOpenOk => Ok(tuning),
        other => Err(handshake_mismatch("Connection.OpenOk", other)),
    }
}

fn handshake_mismatch(expected: &str, got: Method) -> BrokerError {
    match got {
        Method::ConnectionClose {
            reply_code,
            reply_text,
            ..
        } => BrokerError::connection_failed(format!(
            "broker refused connection: {} {}",
            reply_code, reply_text
        )),
        other => BrokerError::connection_failed(format!(
            "expected {} during handshake but broker sent {}",
            expected,
            other.name()
        )),
    }
}

async fn write_step<S>(stream: &mut S, bytes: Bytes, step: Duration, stage: &'static str) -> BrokerResult<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        match stream.write_all(&bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        }
    };
    match timeout(step, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BrokerError::connection_failed(format!(
            "write failed during {}: {}",
            stage, e
        ))),
        Err(_) => {
            warn!(stage, "AMQP handshake step timed out");
            Err(BrokerError::Timeout)
        }
    }
}

async fn read_step<S>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    step: Duration,
    stage: &'static str,
) -> BrokerResult<Method>
where
    S: AsyncRead + Unpin,
{
    match timeout(step, read_connection_method(stream, decoder, stage)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(stage, "AMQP handshake step timed out");
            Err(BrokerError::Timeout)
        }
    }
}

async fn read_connection_method<S>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    stage: &'static str,
) -> BrokerResult<Method>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        while let Some(frame) = decoder.next_frame()? {
            match frame {
                Frame::Heartbeat => continue,
                Frame::Method { channel: 0, method } => return Ok(method),
                other => {
                    return Err(BrokerError::connection_failed(format!(
                        "unexpected frame type {} on channel {} during {}",
                        other.frame_type(),
                        other.channel(),
                        stage
                    )))
                }
            }
        }
        let n = stream.read(&mut buf).await.map_err(|e| {
            BrokerError::connection_failed(format!("read failed during {}: {}", stage, e))
        })?;
        if n == 0 {
            return Err(BrokerError::connection_failed(format!(
                "broker closed the connection during {}",
                stage
            )));
        }
        decoder.feed(&buf[..n]);
    }
}

// ============================================================================
// I/O TASKS
// ============================================================================

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>, link: Arc<Link>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            link.fail(&format!("write failed: {}", e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    mut reader: R,
    mut decoder: FrameDecoder,
    link: Arc<Link>,
    writer: mpsc::UnboundedSender<Bytes>,
    heartbeat: u16,
) where
    R: AsyncRead + Unpin,
{
    let idle_limit = (heartbeat > 0).then(|| Duration::from_secs(u64::from(heartbeat) * 2));
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = 'read: loop {
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => break 'read format!("protocol error: {}", e),
            };

            let mut replies = Vec::new();
            let flow = link.tables.lock().handle_frame(frame, &mut replies);
            for reply in replies {
                match reply.encode() {
                    Ok(bytes) => {
                        let _ = writer.send(bytes);
                    }
                    Err(e) => warn!(error = %e, "Failed to encode reply frame"),
                }
            }

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::ServerClosed {
                    reply_code,
                    reply_text,
                }) => {
                    break 'read format!("connection closed by broker: {} {}", reply_code, reply_text)
                }
                Ok(Flow::CloseAcknowledged) => break 'read "connection closed".to_string(),
                Err(e) => break 'read format!("protocol error: {}", e),
            }
        }

        let read = match idle_limit {
            Some(limit) => match timeout(limit, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => break 'read "missed heartbeats from broker".to_string(),
            },
            None => reader.read(&mut buf).await,
        };
        match read {
            Ok(0) => break 'read "connection closed by broker".to_string(),
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) => break 'read format!("read failed: {}", e),
        }
    };

    link.fail(&reason);
}

async fn heartbeat_loop(writer: mpsc::UnboundedSender<Bytes>, every: Duration) {
    let frame = match Frame::Heartbeat.encode() {
        Ok(frame) => frame,
        Err(_) => return,
    };
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if writer.send(frame.clone()).is_err() {
            return;
        }
    }
}
