//! Unified Message Model
//!
//! [`UnifiedMessage`] is the single shape every adapter produces and accepts.
//! Values are immutable once built: the builder methods consume `self`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// String headers attached to a message
pub type Headers = BTreeMap<String, String>;

/// Unique message identifier, fresh for every constructed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as seen by the orchestrator, independent of the broker it came from
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedMessage {
    id: MessageId,
    subject: String,
    payload: Bytes,
    headers: Option<Headers>,
    reply_to: Option<String>,
    timestamp: DateTime<Utc>,
}

impl UnifiedMessage {
    /// Build a message stamped with a fresh id and the current time
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            subject: subject.into(),
            payload: payload.into(),
            headers: None,
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    /// Replace the full header map; an empty map is stored as no headers
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = if headers.is_empty() { None } else { Some(headers) };
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(key))
            .map(String::as_str)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Payload length in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
