//! RESP2 values, a resumable parser and the command encoder

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mq_types::BrokerError;
use thiserror::Error;

/// Longest accepted bulk string
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Deepest accepted array nesting
const MAX_DEPTH: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RespError {
    #[error("Unknown RESP type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("Malformed RESP line: {0}")]
    Malformed(String),
    #[error("Bulk string length {0} out of range")]
    BulkTooLarge(i64),
    #[error("RESP arrays nested deeper than {MAX_DEPTH}")]
    TooDeep,
}

impl From<RespError> for BrokerError {
    fn from(err: RespError) -> Self {
        BrokerError::provider(format!("Redis protocol: {}", err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Text of a simple or bulk string
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Simple(s) => Some(s.clone()),
            Self::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Simple(s) => Some(Bytes::from(s)),
            Self::Bulk(b) => b,
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}

/// Encode a command as an array of bulk strings
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Bytes {
    let mut out = BytesMut::with_capacity(16 + args.iter().map(|a| a.as_ref().len() + 16).sum::<usize>());
    out.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
    out.freeze()
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Accumulates socket reads and yields complete values
#[derive(Debug, Default)]
pub struct RespParser {
    buf: BytesMut,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete value, `Ok(None)` when more bytes are needed
    pub fn next_value(&mut self) -> Result<Option<RespValue>, RespError> {
        match parse_at(&self.buf, 0, 0)? {
            Some((value, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn line(buf: &[u8], start: usize) -> Result<Option<(&str, usize)>, RespError> {
    let Some(end) = find_crlf(buf, start) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[start..end])
        .map_err(|_| RespError::Malformed("line is not UTF-8".into()))?;
    Ok(Some((text, end + 2)))
}

fn integer(text: &str) -> Result<i64, RespError> {
    text.parse::<i64>()
        .map_err(|_| RespError::Malformed(format!("bad integer '{}'", text)))
}

/// Parse one value starting at `pos`; returns the value and the offset just
/// past it
fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    if depth > MAX_DEPTH {
        return Err(RespError::TooDeep);
    }
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((text, next)) = line(buf, pos + 1)? else {
        return Ok(None);
    };

    match kind {
        b'+' => Ok(Some((RespValue::Simple(text.to_string()), next))),
        b'-' => Ok(Some((RespValue::Error(text.to_string()), next))),
        b':' => Ok(Some((RespValue::Integer(integer(text)?), next))),
        b'$' => {
            let len = integer(text)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            if len > MAX_BULK_LEN {
                return Err(RespError::BulkTooLarge(len));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(RespError::Malformed("bulk string not terminated".into()));
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((RespValue::Bulk(Some(data)), end + 2)))
        }
        b'*' => {
            let count = integer(text)?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(RespError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PMESSAGE: &[u8] =
        b"*4\r\n$8\r\npmessage\r\n$8\r\norders.*\r\n$14\r\norders.created\r\n$8\r\n{\"id\":1}\r\n";

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(&["PUBLISH", "orders", "hi"]),
            Bytes::from_static(b"*3\r\n$7\r\nPUBLISH\r\n$6\r\norders\r\n$2\r\nhi\r\n")
        );
    }

    #[test]
    fn test_parse_scalars() {
        let mut parser = RespParser::new();
        parser.feed(b"+OK\r\n-ERR wrong\r\n:42\r\n$-1\r\n");
        assert_eq!(parser.next_value().unwrap(), Some(RespValue::Simple("OK".into())));
        assert_eq!(parser.next_value().unwrap(), Some(RespValue::Error("ERR wrong".into())));
        assert_eq!(parser.next_value().unwrap(), Some(RespValue::Integer(42)));
        assert_eq!(parser.next_value().unwrap(), Some(RespValue::Bulk(None)));
        assert_eq!(parser.next_value().unwrap(), None);
    }

    #[test]
    fn test_parse_pmessage() {
        let mut parser = RespParser::new();
        parser.feed(PMESSAGE);
        let items = parser.next_value().unwrap().unwrap().into_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].as_text().as_deref(), Some("pmessage"));
        assert_eq!(items[2].as_text().as_deref(), Some("orders.created"));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut parser = RespParser::new();
        parser.feed(b"?what\r\n");
        assert_eq!(parser.next_value(), Err(RespError::UnknownType(b'?')));
    }

    proptest! {
        #[test]
        fn prop_split_point_does_not_matter(split in 0usize..PMESSAGE.len()) {
            let mut parser = RespParser::new();
            parser.feed(&PMESSAGE[..split]);
            prop_assert_eq!(parser.next_value().unwrap(), None);
            parser.feed(&PMESSAGE[split..]);
            let value = parser.next_value().unwrap();
            prop_assert!(matches!(value, Some(RespValue::Array(Some(ref items))) if items.len() == 4));
        }
    }
}
