//! Redis connections
//!
//! Two links per client. The command link is strictly request/response:
//! one command on the wire at a time, serialized by an async mutex. The
//! pub/sub link switches the socket into subscriber mode, so it gets its own
//! receive and writer tasks, and routes `pmessage` pushes by the pattern that
//! matched.

use super::resp::{encode_command, RespParser, RespValue};
use crate::common::{StateNotifier, SubscriptionSender, TaskSet};
use bytes::Bytes;
use mq_network::{BrokerStream, TcpTransportConfig};
use mq_types::{BrokerError, BrokerResult, ConnectionState, UnifiedMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Header naming the pattern a delivered message matched
pub const PATTERN_HEADER: &str = "redis.pattern";

/// Where and how to reach the server
#[derive(Clone)]
pub struct RedisEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<u32>,
    pub client_name: Option<String>,
}

impl fmt::Debug for RedisEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("database", &self.database)
            .finish()
    }
}

impl RedisEndpoint {
    fn auth_command(&self) -> Option<Vec<&str>> {
        let password = self.password.as_deref()?;
        Some(match self.username.as_deref() {
            Some(user) if !user.is_empty() => vec!["AUTH", user, password],
            _ => vec!["AUTH", password],
        })
    }

    async fn open_stream(&self, connect_timeout: Duration) -> BrokerResult<BrokerStream> {
        let transport = TcpTransportConfig {
            connect_timeout,
            nodelay: true,
        };
        Ok(mq_network::connect(&self.host, self.port, self.tls, &transport).await?)
    }
}

fn server_error(context: &str, message: &str) -> BrokerError {
    let lower = message.to_ascii_lowercase();
    if lower.starts_with("noauth") || lower.starts_with("wrongpass") || lower.contains("invalid password") {
        BrokerError::connection_failed(format!("{}: {}", context, message))
    } else {
        BrokerError::provider(format!("{}: {}", context, message))
    }
}

/// Write one command and read exactly one reply
async fn roundtrip<S>(stream: &mut S, parser: &mut RespParser, command: &[u8]) -> BrokerResult<RespValue>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(command)
        .await
        .map_err(|e| BrokerError::connection_failed(format!("write failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| BrokerError::connection_failed(format!("flush failed: {}", e)))?;

    let mut buf = [0u8; 4096];
    loop {
        if let Some(value) = parser.next_value()? {
            return Ok(value);
        }
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| BrokerError::connection_failed(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(BrokerError::connection_failed("server closed the connection"));
        }
        parser.feed(&buf[..n]);
    }
}

/// AUTH, optional SELECT and CLIENT SETNAME, each bounded by `step`
async fn hello<S>(
    stream: &mut S,
    parser: &mut RespParser,
    endpoint: &RedisEndpoint,
    select: bool,
    step: Duration,
) -> BrokerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(auth) = endpoint.auth_command() {
        match timeout(step, roundtrip(stream, parser, &encode_command(&auth))).await {
            Err(_) => return Err(BrokerError::Timeout),
            Ok(reply) => {
                if let RespValue::Error(message) = reply? {
                    return Err(server_error("AUTH rejected", &message));
                }
            }
        }
    }

    if select {
        if let Some(db) = endpoint.database.filter(|db| *db != 0) {
            let db = db.to_string();
            match timeout(step, roundtrip(stream, parser, &encode_command(&["SELECT", db.as_str()]))).await {
                Err(_) => return Err(BrokerError::Timeout),
                Ok(reply) => {
                    if let RespValue::Error(message) = reply? {
                        return Err(BrokerError::invalid_configuration(format!(
                            "SELECT {} rejected: {}",
                            db, message
                        )));
                    }
                }
            }
        }
    }

    if let Some(name) = endpoint.client_name.as_deref() {
        let name: String = name
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .collect();
        let command = encode_command(&["CLIENT", "SETNAME", name.as_str()]);
        match timeout(step, roundtrip(stream, parser, &command)).await {
            Err(_) => return Err(BrokerError::Timeout),
            Ok(reply) => {
                if let RespValue::Error(message) = reply? {
                    warn!(error = %message, "CLIENT SETNAME rejected");
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// COMMAND LINK
// ============================================================================

struct CommandIo {
    stream: BrokerStream,
    parser: RespParser,
    broken: Option<String>,
}

/// Sequential request/response connection used for publishing
pub struct CommandLink {
    io: tokio::sync::Mutex<CommandIo>,
    rpc: Duration,
    state: Arc<StateNotifier>,
}

impl fmt::Debug for CommandLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLink").field("rpc", &self.rpc).finish()
    }
}

impl CommandLink {
    pub async fn open(
        endpoint: &RedisEndpoint,
        connect_timeout: Duration,
        handshake: Duration,
        rpc: Duration,
        state: Arc<StateNotifier>,
    ) -> BrokerResult<Self> {
        let mut stream = endpoint.open_stream(connect_timeout).await?;
        let mut parser = RespParser::new();
        hello(&mut stream, &mut parser, endpoint, true, handshake).await?;

        let link = Self {
            io: tokio::sync::Mutex::new(CommandIo {
                stream,
                parser,
                broken: None,
            }),
            rpc,
            state,
        };
        match link.call(&["PING"]).await? {
            RespValue::Simple(pong) if pong.eq_ignore_ascii_case("PONG") => Ok(link),
            other => Err(BrokerError::connection_failed(format!(
                "unexpected PING reply {:?}",
                other
            ))),
        }
    }

    /// Run one command; a transport failure or timeout poisons the link
    pub async fn call<A: AsRef<[u8]>>(&self, args: &[A]) -> BrokerResult<RespValue> {
        let command = encode_command(args);
        let mut io = self.io.lock().await;
        if io.broken.is_some() {
            return Err(BrokerError::NotConnected);
        }
        let CommandIo { stream, parser, .. } = &mut *io;
        let outcome = match timeout(self.rpc, roundtrip(stream, parser, &command)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout),
        };
        if let Err(e) = &outcome {
            // A half-read reply would desynchronize every later command
            let reason = e.to_string();
            io.broken = Some(reason.clone());
            error!(error = %reason, "Redis command link failed");
            self.state.set(ConnectionState::Error(reason));
        }
        outcome
    }

    /// Best-effort QUIT and shutdown
    pub async fn close(&self, budget: Duration) {
        let mut io = self.io.lock().await;
        if io.broken.is_none() {
            let CommandIo { stream, parser, .. } = &mut *io;
            if timeout(budget, roundtrip(stream, parser, &encode_command(&["QUIT"])))
                .await
                .is_err()
            {
                debug!("QUIT timed out");
            }
            let _ = io.stream.shutdown().await;
        }
        io.broken = Some("closed by client".to_string());
    }
}

// ============================================================================
// PUB/SUB LINK
// ============================================================================

struct Route {
    id: u64,
    tx: SubscriptionSender<UnifiedMessage>,
}

#[derive(Default)]
struct PubSubTables {
    next_id: u64,
    routes: HashMap<String, Vec<Route>>,
    acks: HashMap<String, Vec<oneshot::Sender<()>>>,
    closed: Option<String>,
}

struct PubSubShared {
    tables: Mutex<PubSubTables>,
    state: Arc<StateNotifier>,
    closing: AtomicBool,
}

impl PubSubShared {
    fn dispatch(&self, value: RespValue) {
        let items = match value {
            RespValue::Error(message) => {
                warn!(error = %message, "Redis rejected a subscriber command");
                return;
            }
            other => match other.into_array() {
                Some(items) => items,
                None => {
                    debug!("Ignoring non-array push in subscriber mode");
                    return;
                }
            },
        };
        let mut items = items.into_iter();
        let kind = items
            .next()
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match kind.as_str() {
            "pmessage" => {
                let (Some(pattern), Some(channel), Some(payload)) =
                    (items.next(), items.next(), items.next())
                else {
                    warn!("Truncated pmessage push");
                    return;
                };
                let (Some(pattern), Some(channel)) = (pattern.as_text(), channel.as_text()) else {
                    return;
                };
                let payload = payload.into_bytes().unwrap_or_default();
                self.deliver(&pattern, &channel, payload);
            }
            "psubscribe" => {
                if let Some(pattern) = items.next().and_then(|v| v.as_text()) {
                    let waiters = self.tables.lock().acks.remove(&pattern).unwrap_or_default();
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                    debug!(pattern = %pattern, "PSUBSCRIBE confirmed");
                }
            }
            "punsubscribe" | "pong" => {}
            other => debug!(kind = %other, "Unhandled subscriber push"),
        }
    }

    fn deliver(&self, pattern: &str, channel: &str, payload: Bytes) {
        let mut tables = self.tables.lock();
        let Some(routes) = tables.routes.get_mut(pattern) else {
            debug!(pattern = %pattern, "Message for released pattern dropped");
            return;
        };
        routes.retain(|route| {
            let message = UnifiedMessage::new(channel, payload.clone())
                .with_header(PATTERN_HEADER, pattern);
            route.tx.send(Ok(message)).is_ok()
        });
    }

    fn fail(&self, reason: &str) {
        let routes = {
            let mut tables = self.tables.lock();
            if tables.closed.is_some() {
                return;
            }
            tables.closed = Some(reason.to_string());
            tables.acks.clear();
            std::mem::take(&mut tables.routes)
        };
        if self.closing.load(Ordering::SeqCst) {
            debug!(reason, "Redis subscriber link finished");
            return;
        }
        for route in routes.into_values().flatten() {
            let _ = route
                .tx
                .send(Err(BrokerError::connection_failed(reason.to_string())));
        }
        error!(reason, "Redis subscriber link failed");
        self.state.set(ConnectionState::Error(reason.to_string()));
    }
}

/// Subscriber-mode connection
pub struct PubSubLink {
    shared: Arc<PubSubShared>,
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: TaskSet,
    ack_timeout: Duration,
}

impl fmt::Debug for PubSubLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubLink")
            .field("patterns", &self.shared.tables.lock().routes.len())
            .finish()
    }
}

impl PubSubLink {
    pub async fn open(
        endpoint: &RedisEndpoint,
        connect_timeout: Duration,
        handshake: Duration,
        ack_timeout: Duration,
        state: Arc<StateNotifier>,
    ) -> BrokerResult<Arc<Self>> {
        let mut stream = endpoint.open_stream(connect_timeout).await?;
        let mut parser = RespParser::new();
        // Channels are global across databases, SELECT is irrelevant here
        hello(&mut stream, &mut parser, endpoint, false, handshake).await?;
        info!(host = %endpoint.host, port = endpoint.port, "Redis subscriber connection open");
        Ok(Self::start(stream, parser, ack_timeout, state))
    }

    fn start<S>(stream: S, parser: RespParser, ack_timeout: Duration, state: Arc<StateNotifier>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Bytes>();
        let shared = Arc::new(PubSubShared {
            tables: Mutex::new(PubSubTables::default()),
            state,
            closing: AtomicBool::new(false),
        });

        let tasks = TaskSet::new();
        tasks.spawn(write_loop(write_half, writer_rx, shared.clone()));
        tasks.spawn(read_loop(read_half, parser, shared.clone()));

        Arc::new(Self {
            shared,
            writer: writer_tx,
            tasks,
            ack_timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tables.lock().closed.is_some()
    }

    /// Route `pattern` to `tx`, issuing PSUBSCRIBE for the first route only
    pub async fn subscribe(&self, pattern: &str, tx: SubscriptionSender<UnifiedMessage>) -> BrokerResult<u64> {
        let (id, ack) = {
            let mut tables = self.shared.tables.lock();
            if tables.closed.is_some() {
                return Err(BrokerError::NotConnected);
            }
            tables.next_id += 1;
            let id = tables.next_id;
            let routes = tables.routes.entry(pattern.to_string()).or_default();
            let first = routes.is_empty();
            routes.push(Route { id, tx });
            if !first {
                return Ok(id);
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            tables.acks.entry(pattern.to_string()).or_default().push(ack_tx);
            (id, ack_rx)
        };

        if self
            .writer
            .send(encode_command(&["PSUBSCRIBE", pattern]))
            .is_err()
        {
            self.release(pattern, id);
            return Err(BrokerError::NotConnected);
        }
        match timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(_)) => {
                self.release(pattern, id);
                Err(BrokerError::subscription_failed(format!(
                    "subscriber connection closed before PSUBSCRIBE {} was confirmed",
                    pattern
                )))
            }
            Err(_) => {
                self.release(pattern, id);
                Err(BrokerError::subscription_failed(format!(
                    "PSUBSCRIBE {} not confirmed in time",
                    pattern
                )))
            }
        }
    }

    /// Drop one route; PUNSUBSCRIBE once the pattern has none left
    pub fn release(&self, pattern: &str, id: u64) -> bool {
        let emptied = {
            let mut tables = self.shared.tables.lock();
            let Some(routes) = tables.routes.get_mut(pattern) else {
                return false;
            };
            let before = routes.len();
            routes.retain(|route| route.id != id);
            if routes.len() == before {
                return false;
            }
            let emptied = routes.is_empty();
            if emptied {
                tables.routes.remove(pattern);
            }
            emptied
        };
        if emptied {
            let _ = self.writer.send(encode_command(&["PUNSUBSCRIBE", pattern]));
        }
        true
    }

    /// Drop every route of `pattern`; returns how many ended
    pub fn release_all(&self, pattern: &str) -> usize {
        let removed = self.shared.tables.lock().routes.remove(pattern);
        match removed {
            Some(routes) => {
                let _ = self.writer.send(encode_command(&["PUNSUBSCRIBE", pattern]));
                routes.len()
            }
            None => 0,
        }
    }

    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.writer.send(encode_command(&["PUNSUBSCRIBE"]));
        self.shared.fail("connection closed by client");
        self.tasks.abort_all();
    }
}

impl Drop for PubSubLink {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>, shared: Arc<PubSubShared>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            shared.fail(&format!("write failed: {}", e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, mut parser: RespParser, shared: Arc<PubSubShared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = 'read: loop {
        loop {
            match parser.next_value() {
                Ok(Some(value)) => shared.dispatch(value),
                Ok(None) => break,
                Err(e) => break 'read format!("protocol error: {}", e),
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => break 'read "connection closed by server".to_string(),
            Ok(n) => parser.feed(&buf[..n]),
            Err(e) => break 'read format!("read failed: {}", e),
        }
    };
    shared.fail(&reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Subscription;

    async fn read_command<S: AsyncRead + Unpin>(server: &mut S, parser: &mut RespParser) -> Vec<String> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(value) = parser.next_value().unwrap() {
                return value
                    .into_array()
                    .unwrap()
                    .iter()
                    .filter_map(|v| v.as_text())
                    .collect();
            }
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up");
            parser.feed(&buf[..n]);
        }
    }

    #[test]
    fn test_auth_command_variants() {
        let mut endpoint = RedisEndpoint {
            host: "localhost".into(),
            port: 6379,
            tls: false,
            username: None,
            password: None,
            database: None,
            client_name: None,
        };
        assert!(endpoint.auth_command().is_none());

        endpoint.password = Some("pw".into());
        assert_eq!(endpoint.auth_command().unwrap(), vec!["AUTH", "pw"]);

        endpoint.username = Some("tap".into());
        assert_eq!(endpoint.auth_command().unwrap(), vec!["AUTH", "tap", "pw"]);
        assert!(!format!("{:?}", endpoint).contains("pw"));
    }

    #[test]
    fn test_wrongpass_is_connection_failure() {
        assert!(matches!(
            server_error("AUTH rejected", "WRONGPASS invalid username-password pair"),
            BrokerError::ConnectionFailed(_)
        ));
        assert!(matches!(
            server_error("PUBLISH", "ERR unknown command"),
            BrokerError::ProviderError(_)
        ));
    }

    #[tokio::test]
    async fn test_pattern_refcount_and_routing() {
        let (client, mut server) = tokio::io::duplex(4096);
        let link = PubSubLink::start(
            client,
            RespParser::new(),
            Duration::from_secs(2),
            Arc::new(StateNotifier::new()),
        );

        let (tx_a, rx_a) = Subscription::<UnifiedMessage>::channel();
        let first = {
            let link = link.clone();
            tokio::spawn(async move { link.subscribe("orders.*", tx_a).await })
        };

        let mut parser = RespParser::new();
        assert_eq!(read_command(&mut server, &mut parser).await, vec!["PSUBSCRIBE", "orders.*"]);
        server
            .write_all(b"*3\r\n$10\r\npsubscribe\r\n$8\r\norders.*\r\n:1\r\n")
            .await
            .unwrap();
        let id_a = first.await.unwrap().unwrap();

        // A second route on the same pattern needs no round-trip
        let (tx_b, rx_b) = Subscription::<UnifiedMessage>::channel();
        let id_b = link.subscribe("orders.*", tx_b).await.unwrap();

        server
            .write_all(b"*4\r\n$8\r\npmessage\r\n$8\r\norders.*\r\n$14\r\norders.created\r\n$2\r\nhi\r\n")
            .await
            .unwrap();

        let mut sub_a = Subscription::new("orders.*", rx_a, Arc::new(NoopCancel));
        let mut sub_b = Subscription::new("orders.*", rx_b, Arc::new(NoopCancel));
        for sub in [&mut sub_a, &mut sub_b] {
            let message = sub.recv().await.unwrap().unwrap();
            assert_eq!(message.subject(), "orders.created");
            assert_eq!(message.payload().as_ref(), b"hi");
            assert_eq!(message.header(PATTERN_HEADER), Some("orders.*"));
        }

        assert!(link.release("orders.*", id_a));
        assert!(!link.release("orders.*", id_a));
        assert!(link.release("orders.*", id_b));
        assert_eq!(read_command(&mut server, &mut parser).await, vec!["PUNSUBSCRIBE", "orders.*"]);
    }

    #[tokio::test]
    async fn test_unconfirmed_psubscribe_times_out() {
        let (client, _server) = tokio::io::duplex(4096);
        let link = PubSubLink::start(
            client,
            RespParser::new(),
            Duration::from_millis(50),
            Arc::new(StateNotifier::new()),
        );
        let (tx, _rx) = Subscription::<UnifiedMessage>::channel();
        let err = link.subscribe("a.*", tx).await.unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionFailed(_)));
        assert_eq!(link.release_all("a.*"), 0);
    }

    #[tokio::test]
    async fn test_server_hangup_fails_routes() {
        let (client, mut server) = tokio::io::duplex(4096);
        let state = Arc::new(StateNotifier::new());
        let link = PubSubLink::start(client, RespParser::new(), Duration::from_secs(2), state.clone());

        let (tx, rx) = Subscription::<UnifiedMessage>::channel();
        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.subscribe("x", tx).await })
        };
        let mut parser = RespParser::new();
        read_command(&mut server, &mut parser).await;
        server
            .write_all(b"*3\r\n$10\r\npsubscribe\r\n$1\r\nx\r\n:1\r\n")
            .await
            .unwrap();
        pending.await.unwrap().unwrap();
        drop(server);

        let mut sub = Subscription::new("x", rx, Arc::new(NoopCancel));
        assert!(matches!(sub.recv().await, Some(Err(BrokerError::ConnectionFailed(_)))));
        assert!(link.is_closed());
        assert!(matches!(state.get(), ConnectionState::Error(_)));
    }

    struct NoopCancel;

    impl crate::common::CancelHandle for NoopCancel {
        fn cancel(&self) {}
    }
}
