//! JetStream pull fetches against an in-process NATS server on loopback TCP
//!
//! The server parses client ops line by line, answers the `$JS.API.INFO`
//! probe and consumer lookups, and scripts pull responses by batch size.

use bytes::Bytes;
use mq_adapters::{BasicClient, JetStreamClient, StreamingClient};
use mq_config::SessionSettings;
use mq_types::{BrokerError, ConnectionConfig};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const INFO: &str = concat!(
    r#"INFO {"server_id":"FAKE","server_name":"fake-js","version":"2.10.7","#,
    r#""max_payload":1048576,"headers":true,"jetstream":true}"#,
    "\r\n"
);
const ACCOUNT_INFO: &str = r#"{"type":"io.nats.jetstream.api.v1.account_info_response","memory":0,"storage":0,"streams":1,"consumers":1}"#;
const CONSUMER_INFO: &str = concat!(
    r#"{"type":"io.nats.jetstream.api.v1.consumer_info_response","stream_name":"ORDERS","name":"tap","#,
    r#""config":{"durable_name":"tap","deliver_policy":"all","ack_policy":"explicit","ack_wait":30000000000,"#,
    r#""filter_subject":"orders.*","replay_policy":"instant"}}"#
);
const ACK_SUBJECT: &str = "$JS.ACK.ORDERS.tap.1.7.3.1700000000000000000.0";

#[derive(Debug, Clone, PartialEq)]
enum ServerEvent {
    Subscribed { sid: String, subject: String },
    Unsubscribed { sid: String },
    Pull { subject: String, body: String },
    Published { subject: String, payload: Bytes },
}

struct Session {
    writer: OwnedWriteHalf,
    subs: HashMap<String, String>,
}

impl Session {
    /// Sid of the subscription receiving `subject`, honouring a `*` tail
    fn sid_for(&self, subject: &str) -> Option<String> {
        self.subs.iter().find_map(|(sid, pattern)| {
            let matched = match pattern.strip_suffix(".*") {
                Some(prefix) => subject
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .is_some_and(|token| !token.is_empty() && !token.contains('.')),
                None => pattern == subject,
            };
            matched.then(|| sid.clone())
        })
    }

    async fn msg(&mut self, subject: &str, reply: Option<&str>, payload: &[u8]) {
        let Some(sid) = self.sid_for(subject) else {
            return;
        };
        let head = match reply {
            Some(reply) => format!("MSG {} {} {} {}\r\n", subject, sid, reply, payload.len()),
            None => format!("MSG {} {} {}\r\n", subject, sid, payload.len()),
        };
        let mut frame = head.into_bytes();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.writer.write_all(&frame).await.unwrap();
    }

    async fn status(&mut self, subject: &str, code: u16, description: &str) {
        let Some(sid) = self.sid_for(subject) else {
            return;
        };
        let headers = format!("NATS/1.0 {} {}\r\n\r\n", code, description);
        let frame = format!(
            "HMSG {} {} {} {}\r\n{}\r\n",
            subject,
            sid,
            headers.len(),
            headers.len(),
            headers
        );
        self.writer.write_all(frame.as_bytes()).await.unwrap();
    }
}

async fn serve(socket: TcpStream, events: mpsc::UnboundedSender<ServerEvent>) {
    let (read_half, writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut session = Session {
        writer,
        subs: HashMap::new(),
    };
    session.writer.write_all(INFO.as_bytes()).await.unwrap();

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(op) = parts.first().map(|op| op.to_ascii_uppercase()) else {
            continue;
        };
        match op.as_str() {
            "CONNECT" | "PONG" => {}
            "PING" => session.writer.write_all(b"PONG\r\n").await.unwrap(),
            "SUB" => {
                let sid = parts[parts.len() - 1].to_string();
                session.subs.insert(sid.clone(), parts[1].to_string());
                let _ = events.send(ServerEvent::Subscribed {
                    sid,
                    subject: parts[1].to_string(),
                });
            }
            "UNSUB" => {
                session.subs.remove(parts[1]);
                let _ = events.send(ServerEvent::Unsubscribed {
                    sid: parts[1].to_string(),
                });
            }
            "PUB" | "HPUB" => {
                let subject = parts[1].to_string();
                let total: usize = parts[parts.len() - 1].parse().unwrap();
                let (reply, header_len) = if op == "PUB" {
                    (parts.get(2).filter(|_| parts.len() == 4).map(|r| r.to_string()), 0)
                } else {
                    let header_len: usize = parts[parts.len() - 2].parse().unwrap();
                    (parts.get(2).filter(|_| parts.len() == 5).map(|r| r.to_string()), header_len)
                };
                let mut data = vec![0u8; total + 2];
                reader.read_exact(&mut data).await.unwrap();
                let payload = Bytes::copy_from_slice(&data[header_len..total]);
                handle_publish(&mut session, &events, subject, reply, payload).await;
            }
            other => panic!("fake server got unexpected op {}", other),
        }
    }
}

async fn handle_publish(
    session: &mut Session,
    events: &mpsc::UnboundedSender<ServerEvent>,
    subject: String,
    reply: Option<String>,
    payload: Bytes,
) {
    if subject == "$JS.API.INFO" {
        if let Some(reply) = reply {
            session.msg(&reply, None, ACCOUNT_INFO.as_bytes()).await;
        }
        return;
    }

    if subject == "$JS.API.CONSUMER.INFO.ORDERS.tap" {
        if let Some(reply) = reply {
            session.msg(&reply, None, CONSUMER_INFO.as_bytes()).await;
        }
        return;
    }

    if subject.starts_with("$JS.API.CONSUMER.MSG.NEXT.") {
        let body = String::from_utf8_lossy(&payload).into_owned();
        let request: serde_json::Value = serde_json::from_str(&body).unwrap();
        let _ = events.send(ServerEvent::Pull {
            subject: subject.clone(),
            body,
        });
        let Some(reply) = reply else {
            return;
        };
        match request["batch"].as_u64() {
            // One message, then nothing left
            Some(2) => {
                session
                    .msg(&reply, Some(ACK_SUBJECT), br#"{"id":7}"#)
                    .await;
                session.status(&reply, 404, "No Messages").await;
            }
            // Empty stream: expire the pull after its own timeout
            _ => {
                let expires_ns = request["expires"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_nanos(expires_ns)).await;
                session.status(&reply, 408, "Request Timeout").await;
            }
        }
        return;
    }

    let _ = events.send(ServerEvent::Published { subject, payload });
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            serve(socket, tx).await;
        }
    });
    (format!("nats://127.0.0.1:{}", port), rx)
}

/// Next event accepted by `wanted`, skipping the rest
async fn next_event(
    events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    wanted: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("fake server stopped");
        if wanted(&event) {
            return event;
        }
    }
}

fn is_pull(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Pull { .. })
}

fn is_published(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Published { .. })
}

/// Sid of the next pull inbox subscription; the request mux uses a wildcard
async fn next_inbox_sid(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> String {
    let event = next_event(events, |event| {
        matches!(event, ServerEvent::Subscribed { subject, .. } if !subject.ends_with(".*"))
    })
    .await;
    match event {
        ServerEvent::Subscribed { sid, .. } => sid,
        other => panic!("unexpected {:?}", other),
    }
}

async fn connected_client() -> (JetStreamClient, mpsc::UnboundedReceiver<ServerEvent>) {
    connected_client_with(SessionSettings::default()).await
}

async fn connected_client_with(
    settings: SessionSettings,
) -> (JetStreamClient, mpsc::UnboundedReceiver<ServerEvent>) {
    let (url, events) = spawn_server().await;
    let client = JetStreamClient::new(&settings);
    client.connect(&ConnectionConfig::new(url)).await.unwrap();
    assert!(client.is_streaming_available());
    (client, events)
}

#[tokio::test]
async fn test_empty_fetch_returns_after_expiry() {
    let (client, mut events) = connected_client().await;

    let started = Instant::now();
    let messages = client
        .fetch("ORDERS", "tap", 5, Duration::from_millis(200))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(messages.is_empty());
    assert!(elapsed >= Duration::from_millis(150), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "returned after {:?}", elapsed);

    let pull = next_event(&mut events, is_pull).await;
    assert_eq!(
        pull,
        ServerEvent::Pull {
            subject: "$JS.API.CONSUMER.MSG.NEXT.ORDERS.tap".to_string(),
            body: r#"{"batch":5,"expires":200000000}"#.to_string(),
        }
    );

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_fetched_message_acks_once() {
    let (client, mut events) = connected_client().await;

    let messages = client
        .fetch("ORDERS", "tap", 2, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.message().payload().as_ref(), br#"{"id":7}"#);
    assert_eq!(message.metadata().stream_sequence, 7);
    assert_eq!(message.metadata().consumer_sequence, 3);
    assert_eq!(message.metadata().delivered, 1);

    message.ack().await.unwrap();
    assert!(matches!(
        message.ack().await,
        Err(BrokerError::ProviderError(_))
    ));

    let ack = next_event(&mut events, is_published).await;
    assert_eq!(
        ack,
        ServerEvent::Published {
            subject: ACK_SUBJECT.to_string(),
            payload: Bytes::from_static(b"+ACK"),
        }
    );

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_second_consume_stops_the_first() {
    let mut settings = SessionSettings::default();
    settings.nats.pull_batch = 3;
    settings.nats.pull_expires_ms = 100;
    let (client, mut events) = connected_client_with(settings).await;

    let mut first = client.consume("ORDERS", "tap").await.unwrap();
    let first_sid = next_inbox_sid(&mut events).await;
    let pull = next_event(&mut events, is_pull).await;
    assert_eq!(
        pull,
        ServerEvent::Pull {
            subject: "$JS.API.CONSUMER.MSG.NEXT.ORDERS.tap".to_string(),
            body: r#"{"batch":3,"expires":100000000}"#.to_string(),
        }
    );

    let second = client.consume("ORDERS", "tap").await.unwrap();
    let stopped = next_event(&mut events, |event| {
        matches!(event, ServerEvent::Unsubscribed { .. })
    })
    .await;
    assert_eq!(stopped, ServerEvent::Unsubscribed { sid: first_sid.clone() });
    let second_sid = next_inbox_sid(&mut events).await;
    assert_ne!(second_sid, first_sid);

    let ended = timeout(Duration::from_secs(1), first.recv()).await.unwrap();
    assert!(ended.is_none());
    assert!(!second.is_cancelled());
    assert_eq!(second.pattern(), "ORDERS/tap");

    client.disconnect().await.unwrap();
}
