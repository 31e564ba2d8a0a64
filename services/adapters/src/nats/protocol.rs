//! NATS client protocol
//!
//! Text control lines terminated by CRLF, some followed by a sized payload.
//! The parser keeps partial input between reads and yields one
//! [`ServerOp`] at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mq_types::{BrokerError, Headers};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";
const MAX_CONTROL_LINE: usize = 64 * 1024;
const HEADER_VERSION: &str = "NATS/1.0";
/// Payload limit assumed until the server's INFO says otherwise
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NatsProtocolError {
    #[error("Control line exceeds {max} bytes")]
    ControlLineTooLong { max: usize },

    #[error("Unknown protocol operation '{op}'")]
    UnknownOperation { op: String },

    #[error("Malformed {op}: {reason}")]
    Malformed { op: &'static str, reason: String },

    #[error("{op} payload of {size} bytes exceeds max_payload {max}")]
    PayloadTooLarge { op: &'static str, size: u64, max: usize },
}

impl NatsProtocolError {
    fn malformed(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            op,
            reason: reason.into(),
        }
    }
}

impl From<NatsProtocolError> for BrokerError {
    fn from(err: NatsProtocolError) -> Self {
        BrokerError::provider(format!("NATS protocol error: {}", err))
    }
}

/// Server `INFO` payload; unknown fields are ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub max_payload: usize,
    pub headers: bool,
    pub auth_required: bool,
    pub tls_required: bool,
    pub tls_available: bool,
    pub jetstream: bool,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            server_name: String::new(),
            version: String::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            headers: false,
            auth_required: false,
            tls_required: false,
            tls_available: false,
            jetstream: false,
        }
    }
}

/// Client `CONNECT` payload
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    pub name: String,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: u8,
    pub headers: bool,
    pub no_responders: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl ConnectInfo {
    pub fn new(name: impl Into<String>, tls_required: bool) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required,
            name: name.into(),
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            headers: true,
            no_responders: true,
            user: None,
            pass: None,
            auth_token: None,
        }
    }
}

/// Message headers plus the optional inline status (`NATS/1.0 404 No Messages`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatsHeaders {
    pub status: Option<u16>,
    pub description: Option<String>,
    pub values: Headers,
}

impl NatsHeaders {
    pub fn parse(raw: &[u8]) -> Result<Self, NatsProtocolError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| NatsProtocolError::malformed("HMSG", "headers are not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let version_line = lines.next().unwrap_or_default();
        let rest = version_line
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| NatsProtocolError::malformed("HMSG", "missing NATS/1.0 header line"))?
            .trim();

        let mut headers = NatsHeaders::default();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, Some(description.trim().to_string())),
                None => (rest, None),
            };
            headers.status = code.parse().ok();
            headers.description = description.filter(|d| !d.is_empty());
        }

        for line in lines.filter(|l| !l.is_empty()) {
            if let Some((key, value)) = line.split_once(':') {
                headers
                    .values
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(headers)
    }

    pub fn encode(values: &Headers) -> Bytes {
        let mut out = BytesMut::with_capacity(32 + values.len() * 32);
        out.put_slice(HEADER_VERSION.as_bytes());
        out.put_slice(CRLF);
        for (key, value) in values {
            out.put_slice(key.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(CRLF);
        }
        out.put_slice(CRLF);
        out.freeze()
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    pub headers: Option<NatsHeaders>,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(|h| h.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg(InboundMessage),
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Resumable parser for server operations
///
/// Inbound payloads are capped at the server's advertised `max_payload`,
/// which every INFO updates.
#[derive(Debug)]
pub struct ProtocolParser {
    buf: BytesMut,
    max_payload: usize,
}

impl Default for ProtocolParser {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete operation, or `None` until more input arrives
    pub fn next_op(&mut self) -> Result<Option<ServerOp>, NatsProtocolError> {
        let Some(line_end) = find_crlf(&self.buf) else {
            if self.buf.len() > MAX_CONTROL_LINE {
                return Err(NatsProtocolError::ControlLineTooLong {
                    max: MAX_CONTROL_LINE,
                });
            }
            return Ok(None);
        };

        let line = std::str::from_utf8(&self.buf[..line_end])
            .map_err(|_| NatsProtocolError::malformed("control line", "not UTF-8"))?
            .to_string();
        let (op, args) = match line.split_once([' ', '\t']) {
            Some((op, args)) => (op.to_ascii_uppercase(), args.trim()),
            None => (line.trim().to_ascii_uppercase(), ""),
        };

        let control_len = line_end + CRLF.len();
        match op.as_str() {
            "MSG" => self.parse_msg(args, control_len),
            "HMSG" => self.parse_hmsg(args, control_len),
            "PING" => self.simple(control_len, ServerOp::Ping),
            "PONG" => self.simple(control_len, ServerOp::Pong),
            "+OK" => self.simple(control_len, ServerOp::Ok),
            "-ERR" => {
                let message = args.trim_matches('\'').to_string();
                self.simple(control_len, ServerOp::Err(message))
            }
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(args)
                    .map_err(|e| NatsProtocolError::malformed("INFO", e.to_string()))?;
                if info.max_payload > 0 {
                    self.max_payload = info.max_payload;
                }
                self.simple(control_len, ServerOp::Info(Box::new(info)))
            }
            _ => Err(NatsProtocolError::UnknownOperation { op }),
        }
    }

    fn simple(&mut self, consumed: usize, op: ServerOp) -> Result<Option<ServerOp>, NatsProtocolError> {
        self.buf.advance(consumed);
        Ok(Some(op))
    }

    fn parse_msg(&mut self, args: &str, control_len: usize) -> Result<Option<ServerOp>, NatsProtocolError> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (subject, sid, reply_to, size) = match parts.as_slice() {
            [subject, sid, size] => (*subject, *sid, None, *size),
            [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
            _ => return Err(NatsProtocolError::malformed("MSG", format!("'{}'", args))),
        };
        let sid = parse_number("MSG", sid)?;
        let size = self.payload_size("MSG", size)?;

        let total = frame_len("MSG", control_len, size)?;
        if self.buf.len() < total {
            return Ok(None);
        }
        let message = InboundMessage {
            subject: subject.to_string(),
            sid,
            reply_to: reply_to.map(str::to_string),
            headers: None,
            payload: Bytes::new(),
        };
        self.buf.advance(control_len);
        let payload = self.buf.split_to(size).freeze();
        self.buf.advance(CRLF.len());
        Ok(Some(ServerOp::Msg(InboundMessage { payload, ..message })))
    }

    fn parse_hmsg(&mut self, args: &str, control_len: usize) -> Result<Option<ServerOp>, NatsProtocolError> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (subject, sid, reply_to, header_size, total_size) = match parts.as_slice() {
            [subject, sid, hdr, total] => (*subject, *sid, None, *hdr, *total),
            [subject, sid, reply, hdr, total] => (*subject, *sid, Some(*reply), *hdr, *total),
            _ => return Err(NatsProtocolError::malformed("HMSG", format!("'{}'", args))),
        };
        let sid = parse_number("HMSG", sid)?;
        let header_size = parse_number("HMSG", header_size)? as usize;
        let total_size = self.payload_size("HMSG", total_size)?;
        if header_size > total_size {
            return Err(NatsProtocolError::malformed(
                "HMSG",
                format!("header size {} exceeds total {}", header_size, total_size),
            ));
        }

        let total = frame_len("HMSG", control_len, total_size)?;
        if self.buf.len() < total {
            return Ok(None);
        }
        let subject = subject.to_string();
        let reply_to = reply_to.map(str::to_string);
        self.buf.advance(control_len);
        let header_block = self.buf.split_to(header_size);
        let payload = self.buf.split_to(total_size - header_size).freeze();
        self.buf.advance(CRLF.len());

        Ok(Some(ServerOp::Msg(InboundMessage {
            subject,
            sid,
            reply_to,
            headers: Some(NatsHeaders::parse(&header_block)?),
            payload,
        })))
    }
}

impl ProtocolParser {
    fn payload_size(&self, op: &'static str, raw: &str) -> Result<usize, NatsProtocolError> {
        let size = parse_number(op, raw)?;
        match usize::try_from(size) {
            Ok(size) if size <= self.max_payload => Ok(size),
            _ => Err(NatsProtocolError::PayloadTooLarge {
                op,
                size,
                max: self.max_payload,
            }),
        }
    }
}

/// Control line, payload and trailing CRLF
fn frame_len(op: &'static str, control_len: usize, size: usize) -> Result<usize, NatsProtocolError> {
    control_len
        .checked_add(size)
        .and_then(|n| n.checked_add(CRLF.len()))
        .ok_or_else(|| NatsProtocolError::malformed(op, format!("size {} overflows", size)))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn parse_number(op: &'static str, raw: &str) -> Result<u64, NatsProtocolError> {
    raw.parse()
        .map_err(|_| NatsProtocolError::malformed(op, format!("invalid number '{}'", raw)))
}

// ============================================================================
// CLIENT COMMANDS
// ============================================================================

pub fn encode_connect(info: &ConnectInfo) -> Result<Bytes, BrokerError> {
    let json = serde_json::to_string(info)
        .map_err(|e| BrokerError::invalid_configuration(format!("CONNECT payload: {}", e)))?;
    Ok(Bytes::from(format!("CONNECT {}\r\n", json)))
}

pub fn encode_pub(subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(subject.len() + payload.len() + 32);
    out.put_slice(b"PUB ");
    out.put_slice(subject.as_bytes());
    if let Some(reply) = reply_to {
        out.put_u8(b' ');
        out.put_slice(reply.as_bytes());
    }
    out.put_slice(format!(" {}\r\n", payload.len()).as_bytes());
    out.put_slice(payload);
    out.put_slice(CRLF);
    out.freeze()
}

pub fn encode_hpub(subject: &str, reply_to: Option<&str>, headers: &Headers, payload: &[u8]) -> Bytes {
    let header_block = NatsHeaders::encode(headers);
    let mut out = BytesMut::with_capacity(subject.len() + header_block.len() + payload.len() + 48);
    out.put_slice(b"HPUB ");
    out.put_slice(subject.as_bytes());
    if let Some(reply) = reply_to {
        out.put_u8(b' ');
        out.put_slice(reply.as_bytes());
    }
    out.put_slice(
        format!(
            " {} {}\r\n",
            header_block.len(),
            header_block.len() + payload.len()
        )
        .as_bytes(),
    );
    out.put_slice(&header_block);
    out.put_slice(payload);
    out.put_slice(CRLF);
    out.freeze()
}

pub fn encode_sub(subject: &str, sid: u64) -> Bytes {
    Bytes::from(format!("SUB {} {}\r\n", subject, sid))
}

pub fn encode_unsub(sid: u64) -> Bytes {
    Bytes::from(format!("UNSUB {}\r\n", sid))
}
