//! NATS connection
//!
//! Handshake (`INFO` → optional TLS → `CONNECT` + `PING` → `PONG`), then a
//! receive task, a single writer task and a keep-alive pinger. Subscriptions
//! are delivery callbacks keyed by sid; request/reply shares one wildcard
//! inbox and routes replies by their last subject token.

use super::protocol::{
    encode_connect, encode_hpub, encode_pub, encode_sub, encode_unsub, ConnectInfo,
    InboundMessage, ProtocolParser, ServerInfo, ServerOp, PING, PONG,
};
use crate::common::{StateNotifier, TaskSet};
use bytes::Bytes;
use mq_config::TimeoutSettings;
use mq_network::{upgrade_tls, BrokerStream};
use mq_types::{BrokerError, BrokerResult, ConnectionState, Headers};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Delivery callback; returns false once the receiver is gone
pub type Deliver = Box<dyn Fn(BrokerResult<InboundMessage>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct NatsParams {
    pub name: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub tls: bool,
    pub ping_interval: Duration,
    pub max_pings_outstanding: u32,
    pub timeouts: TimeoutSettings,
}

impl fmt::Debug for NatsParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsParams")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("tls", &self.tls)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

/// Fresh unique inbox subject
pub fn new_inbox() -> String {
    format!("_INBOX.{}", Uuid::new_v4().simple())
}

struct SubSlot {
    subject: String,
    deliver: Deliver,
}

#[derive(Default)]
struct Tables {
    next_sid: u64,
    subs: HashMap<u64, SubSlot>,
    requests: HashMap<String, oneshot::Sender<InboundMessage>>,
    pings_outstanding: u32,
    pong_waiters: VecDeque<oneshot::Sender<()>>,
    closed: Option<String>,
}

struct Link {
    tables: Mutex<Tables>,
    state: Arc<StateNotifier>,
    closing: AtomicBool,
    /// `<mux inbox>.` prefix of request replies
    reply_prefix: String,
}

impl Link {
    fn fail(&self, reason: &str) {
        let (first, slots) = {
            let mut tables = self.tables.lock();
            let first = tables.closed.is_none();
            if first {
                tables.closed = Some(reason.to_string());
            }
            tables.requests.clear();
            tables.pong_waiters.clear();
            let slots: Vec<SubSlot> = tables.subs.drain().map(|(_, slot)| slot).collect();
            (first, slots)
        };
        for slot in slots {
            (slot.deliver)(Err(BrokerError::connection_failed(reason.to_string())));
        }
        if !first || self.closing.load(Ordering::SeqCst) {
            debug!(reason, "NATS connection finished");
            return;
        }
        error!(reason, "NATS connection failed");
        self.state.set(ConnectionState::Error(reason.to_string()));
    }

    fn dispatch(&self, op: ServerOp, writer: &mpsc::UnboundedSender<Bytes>) -> Result<(), String> {
        match op {
            ServerOp::Msg(message) => {
                if let Some(token) = message.subject.strip_prefix(&self.reply_prefix) {
                    let waiter = self.tables.lock().requests.remove(token);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(message);
                        }
                        None => debug!(subject = %message.subject, "Late reply dropped"),
                    }
                    return Ok(());
                }

                let sid = message.sid;
                let mut tables = self.tables.lock();
                let alive = match tables.subs.get(&sid) {
                    Some(slot) => (slot.deliver)(Ok(message)),
                    None => {
                        debug!(sid, "Message for unknown subscription dropped");
                        true
                    }
                };
                if !alive && tables.subs.remove(&sid).is_some() {
                    drop(tables);
                    let _ = writer.send(encode_unsub(sid));
                }
                Ok(())
            }
            ServerOp::Ping => {
                let _ = writer.send(Bytes::from_static(PONG));
                Ok(())
            }
            ServerOp::Pong => {
                let mut tables = self.tables.lock();
                tables.pings_outstanding = 0;
                if let Some(waiter) = tables.pong_waiters.pop_front() {
                    let _ = waiter.send(());
                }
                Ok(())
            }
            ServerOp::Ok => Ok(()),
            ServerOp::Info(info) => {
                debug!(server = %info.server_name, "Updated server INFO");
                Ok(())
            }
            ServerOp::Err(message) => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("permissions violation") || lower.contains("invalid subject") {
                    warn!(error = %message, "NATS server rejected an operation");
                    Ok(())
                } else {
                    Err(format!("server error: {}", message))
                }
            }
        }
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct NatsConnection {
    link: Arc<Link>,
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: TaskSet,
    info: ServerInfo,
    mux_inbox: String,
    next_token: AtomicU64,
}

impl fmt::Debug for NatsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsConnection")
            .field("server", &self.info.server_name)
            .field("version", &self.info.version)
            .field("max_payload", &self.info.max_payload)
            .finish()
    }
}

impl NatsConnection {
    pub async fn open(
        stream: BrokerStream,
        host: &str,
        params: &NatsParams,
        state: Arc<StateNotifier>,
    ) -> BrokerResult<Arc<Self>> {
        let (stream, parser, info) = handshake(stream, host, params).await?;
        info!(
            server = %info.server_name,
            version = %info.version,
            jetstream = info.jetstream,
            tls = stream.is_tls(),
            "NATS handshake complete"
        );

        let mux_inbox = new_inbox();
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Bytes>();
        let link = Arc::new(Link {
            tables: Mutex::new(Tables::default()),
            state,
            closing: AtomicBool::new(false),
            reply_prefix: format!("{}.", mux_inbox),
        });

        let tasks = TaskSet::new();
        tasks.spawn(write_loop(write_half, writer_rx, link.clone()));
        tasks.spawn(read_loop(read_half, parser, link.clone(), writer_tx.clone()));
        if !params.ping_interval.is_zero() {
            tasks.spawn(ping_loop(
                link.clone(),
                writer_tx.clone(),
                params.ping_interval,
                params.max_pings_outstanding,
            ));
        }

        let connection = Arc::new(Self {
            link,
            writer: writer_tx,
            tasks,
            info,
            mux_inbox,
            next_token: AtomicU64::new(1),
        });
        // Replies are routed by subject prefix before sid lookup
        connection.subscribe(&format!("{}.*", connection.mux_inbox), Box::new(|_| true))?;
        Ok(connection)
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.link.tables.lock().closed.is_some()
    }

    fn send(&self, bytes: Bytes) -> BrokerResult<()> {
        self.writer.send(bytes).map_err(|_| BrokerError::NotConnected)
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            Err(BrokerError::NotConnected)
        } else {
            Ok(())
        }
    }

    pub fn subscribe(&self, subject: &str, deliver: Deliver) -> BrokerResult<u64> {
        validate_subject(subject)?;
        let sid = {
            let mut tables = self.link.tables.lock();
            if tables.closed.is_some() {
                return Err(BrokerError::NotConnected);
            }
            tables.next_sid += 1;
            let sid = tables.next_sid;
            tables.subs.insert(
                sid,
                SubSlot {
                    subject: subject.to_string(),
                    deliver,
                },
            );
            sid
        };
        if let Err(e) = self.send(encode_sub(subject, sid)) {
            self.link.tables.lock().subs.remove(&sid);
            return Err(e);
        }
        debug!(subject = %subject, sid, "Subscribed");
        Ok(sid)
    }

    /// Remove one subscription; false when it was already gone
    pub fn unsubscribe_sid(&self, sid: u64) -> bool {
        let removed = self.link.tables.lock().subs.remove(&sid).is_some();
        if removed {
            let _ = self.send(encode_unsub(sid));
            debug!(sid, "Unsubscribed");
        }
        removed
    }

    /// Remove every subscription on `subject`
    pub fn unsubscribe_subject(&self, subject: &str) -> usize {
        let sids: Vec<u64> = {
            let mut tables = self.link.tables.lock();
            let sids: Vec<u64> = tables
                .subs
                .iter()
                .filter(|(_, slot)| slot.subject == subject)
                .map(|(sid, _)| *sid)
                .collect();
            for sid in &sids {
                tables.subs.remove(sid);
            }
            sids
        };
        for sid in &sids {
            let _ = self.send(encode_unsub(*sid));
        }
        sids.len()
    }

    pub fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: Option<&Headers>,
        payload: &[u8],
    ) -> BrokerResult<()> {
        validate_subject(subject)?;
        self.ensure_open()?;
        if payload.len() > self.info.max_payload {
            return Err(BrokerError::publish_failed(format!(
                "payload of {} bytes exceeds server max_payload {}",
                payload.len(),
                self.info.max_payload
            )));
        }

        let bytes = match headers.filter(|h| !h.is_empty()) {
            Some(headers) if self.info.headers => encode_hpub(subject, reply_to, headers, payload),
            Some(_) => {
                debug!(subject = %subject, "Server does not support headers, sending without");
                encode_pub(subject, reply_to, payload)
            }
            None => encode_pub(subject, reply_to, payload),
        };
        self.send(bytes)
    }

    /// Publish and wait for the first reply
    pub async fn request(
        &self,
        subject: &str,
        headers: Option<&Headers>,
        payload: &[u8],
        wait: Duration,
    ) -> BrokerResult<InboundMessage> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
        let reply = format!("{}.{}", self.mux_inbox, token);

        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.link.tables.lock();
            if tables.closed.is_some() {
                return Err(BrokerError::NotConnected);
            }
            tables.requests.insert(token.clone(), tx);
        }
        if let Err(e) = self.publish(subject, Some(&reply), headers, payload) {
            self.link.tables.lock().requests.remove(&token);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(BrokerError::connection_failed("connection closed")),
            Err(_) => {
                self.link.tables.lock().requests.remove(&token);
                debug!(subject = %subject, "Request timed out");
                Err(BrokerError::Timeout)
            }
        }
    }

    /// Round-trip a PING so every earlier write has reached the server
    pub async fn flush(&self, wait: Duration) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.link.tables.lock();
            if tables.closed.is_some() {
                return Err(BrokerError::NotConnected);
            }
            tables.pong_waiters.push_back(tx);
        }
        self.send(Bytes::from_static(PING))?;
        match timeout(wait, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::connection_failed("connection closed")),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    pub async fn close(&self, budget: Duration) {
        self.link.closing.store(true, Ordering::SeqCst);
        if !self.is_closed() {
            if let Err(e) = self.flush(budget).await {
                debug!(error = %e, "Flush before close failed");
            }
        }
        self.link.fail("connection closed by client");
        self.tasks.abort_all();
    }
}

impl Drop for NatsConnection {
    fn drop(&mut self) {
        self.link.closing.store(true, Ordering::SeqCst);
    }
}

fn validate_subject(subject: &str) -> BrokerResult<()> {
    if subject.is_empty() || subject.contains(char::is_whitespace) {
        return Err(BrokerError::invalid_configuration(format!(
            "invalid NATS subject '{}'",
            subject
        )));
    }
    Ok(())
}

// ============================================================================
// HANDSHAKE
// ============================================================================

async fn handshake(
    stream: BrokerStream,
    host: &str,
    params: &NatsParams,
) -> BrokerResult<(BrokerStream, ProtocolParser, ServerInfo)> {
    let step = params.timeouts.handshake();
    let mut stream = stream;
    let mut parser = ProtocolParser::new();

    let info = match read_op(&mut stream, &mut parser, step, "INFO").await? {
        ServerOp::Info(info) => *info,
        other => {
            return Err(BrokerError::connection_failed(format!(
                "expected INFO from server, got {:?}",
                other
            )))
        }
    };

    let tls = params.tls || info.tls_required;
    if tls && !stream.is_tls() {
        stream = upgrade_tls(stream, host).await?;
    }

    let mut connect = ConnectInfo::new(params.name.clone(), tls);
    connect.user = params.user.clone();
    connect.pass = params.pass.clone();
    connect.auth_token = params.token.clone();

    let mut hello = encode_connect(&connect)?.to_vec();
    hello.extend_from_slice(PING);
    write_all(&mut stream, &hello, step).await?;

    loop {
        match read_op(&mut stream, &mut parser, step, "PONG").await? {
            ServerOp::Pong => break,
            ServerOp::Ping => write_all(&mut stream, PONG, step).await?,
            ServerOp::Err(message) => {
                return Err(BrokerError::connection_failed(format!(
                    "server rejected connection: {}",
                    message
                )))
            }
            ServerOp::Ok | ServerOp::Info(_) | ServerOp::Msg(_) => continue,
        }
    }
    Ok((stream, parser, info))
}

async fn write_all<S>(stream: &mut S, bytes: &[u8], step: Duration) -> BrokerResult<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        match stream.write_all(bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        }
    };
    match timeout(step, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BrokerError::connection_failed(format!("write failed: {}", e))),
        Err(_) => Err(BrokerError::Timeout),
    }
}

async fn read_op<S>(
    stream: &mut S,
    parser: &mut ProtocolParser,
    step: Duration,
    stage: &'static str,
) -> BrokerResult<ServerOp>
where
    S: AsyncRead + Unpin,
{
    match timeout(step, next_server_op(stream, parser, stage)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(stage, "NATS handshake step timed out");
            Err(BrokerError::Timeout)
        }
    }
}

async fn next_server_op<S>(
    stream: &mut S,
    parser: &mut ProtocolParser,
    stage: &'static str,
) -> BrokerResult<ServerOp>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        if let Some(op) = parser.next_op()? {
            return Ok(op);
        }
        let n = stream.read(&mut buf).await.map_err(|e| {
            BrokerError::connection_failed(format!("read failed waiting for {}: {}", stage, e))
        })?;
        if n == 0 {
            return Err(BrokerError::connection_failed(format!(
                "server closed the connection waiting for {}",
                stage
            )));
        }
        parser.feed(&buf[..n]);
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
    mut parser: ProtocolParser,
    link: Arc<Link>,
    writer: mpsc::UnboundedSender<Bytes>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = 'read: loop {
        loop {
            match parser.next_op() {
                Ok(Some(op)) => {
                    if let Err(reason) = link.dispatch(op, &writer) {
                        break 'read reason;
                    }
                }
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
    link.fail(&reason);
}

async fn ping_loop(
    link: Arc<Link>,
    writer: mpsc::UnboundedSender<Bytes>,
    every: Duration,
    max_outstanding: u32,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stale = {
            let mut tables = link.tables.lock();
            if tables.closed.is_some() {
                return;
            }
            if tables.pings_outstanding >= max_outstanding {
                true
            } else {
                tables.pings_outstanding += 1;
                false
            }
        };
        if stale {
            link.fail("stale connection: server stopped answering PING");
            return;
        }
        if writer.send(Bytes::from_static(PING)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_is_unique() {
        let a = new_inbox();
        assert!(a.starts_with("_INBOX."));
        assert_ne!(a, new_inbox());
    }

    #[test]
    fn test_subject_validation() {
        assert!(validate_subject("orders.>").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("a b").is_err());
    }
}
