//! Basic-class content properties and content headers
//!
//! Properties are preceded by a 16-bit presence mask, highest bit first in
//! field order. Bit 0 flags a continuation word, which this client never
//! writes and skips when reading.

use crate::buffers::{FieldReader, FieldWriter};
use crate::error::ProtocolResult;
use crate::table::FieldTable;

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;
const FLAG_CONTINUATION: u16 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, flag: u16| {
            if present {
                flags |= flag;
            }
        };
        set(self.content_type.is_some(), FLAG_CONTENT_TYPE);
        set(self.content_encoding.is_some(), FLAG_CONTENT_ENCODING);
        set(self.headers.is_some(), FLAG_HEADERS);
        set(self.delivery_mode.is_some(), FLAG_DELIVERY_MODE);
        set(self.priority.is_some(), FLAG_PRIORITY);
        set(self.correlation_id.is_some(), FLAG_CORRELATION_ID);
        set(self.reply_to.is_some(), FLAG_REPLY_TO);
        set(self.expiration.is_some(), FLAG_EXPIRATION);
        set(self.message_id.is_some(), FLAG_MESSAGE_ID);
        set(self.timestamp.is_some(), FLAG_TIMESTAMP);
        set(self.kind.is_some(), FLAG_TYPE);
        set(self.user_id.is_some(), FLAG_USER_ID);
        set(self.app_id.is_some(), FLAG_APP_ID);
        set(self.cluster_id.is_some(), FLAG_CLUSTER_ID);
        flags
    }

    pub fn encode(&self, w: &mut FieldWriter) -> ProtocolResult<()> {
        w.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            w.put_short_str(v, "content-type")?;
        }
        if let Some(v) = &self.content_encoding {
            w.put_short_str(v, "content-encoding")?;
        }
        if let Some(v) = &self.headers {
            w.put_table(v)?;
        }
        if let Some(v) = self.delivery_mode {
            w.put_u8(v);
        }
        if let Some(v) = self.priority {
            w.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            w.put_short_str(v, "correlation-id")?;
        }
        if let Some(v) = &self.reply_to {
            w.put_short_str(v, "reply-to")?;
        }
        if let Some(v) = &self.expiration {
            w.put_short_str(v, "expiration")?;
        }
        if let Some(v) = &self.message_id {
            w.put_short_str(v, "message-id")?;
        }
        if let Some(v) = self.timestamp {
            w.put_u64(v);
        }
        if let Some(v) = &self.kind {
            w.put_short_str(v, "type")?;
        }
        if let Some(v) = &self.user_id {
            w.put_short_str(v, "user-id")?;
        }
        if let Some(v) = &self.app_id {
            w.put_short_str(v, "app-id")?;
        }
        if let Some(v) = &self.cluster_id {
            w.put_short_str(v, "cluster-id")?;
        }
        Ok(())
    }

    pub fn decode(r: &mut FieldReader<'_>) -> ProtocolResult<Self> {
        let flags = r.read_u16()?;
        let mut extra = flags;
        while extra & FLAG_CONTINUATION != 0 {
            extra = r.read_u16()?;
        }

        let has = |flag: u16| flags & flag != 0;
        let mut props = BasicProperties::default();
        if has(FLAG_CONTENT_TYPE) {
            props.content_type = Some(r.read_short_str()?);
        }
        if has(FLAG_CONTENT_ENCODING) {
            props.content_encoding = Some(r.read_short_str()?);
        }
        if has(FLAG_HEADERS) {
            props.headers = Some(r.read_table()?);
        }
        if has(FLAG_DELIVERY_MODE) {
            props.delivery_mode = Some(r.read_u8()?);
        }
        if has(FLAG_PRIORITY) {
            props.priority = Some(r.read_u8()?);
        }
        if has(FLAG_CORRELATION_ID) {
            props.correlation_id = Some(r.read_short_str()?);
        }
        if has(FLAG_REPLY_TO) {
            props.reply_to = Some(r.read_short_str()?);
        }
        if has(FLAG_EXPIRATION) {
            props.expiration = Some(r.read_short_str()?);
        }
        if has(FLAG_MESSAGE_ID) {
            props.message_id = Some(r.read_short_str()?);
        }
        if has(FLAG_TIMESTAMP) {
            props.timestamp = Some(r.read_u64()?);
        }
        if has(FLAG_TYPE) {
            props.kind = Some(r.read_short_str()?);
        }
        if has(FLAG_USER_ID) {
            props.user_id = Some(r.read_short_str()?);
        }
        if has(FLAG_APP_ID) {
            props.app_id = Some(r.read_short_str()?);
        }
        if has(FLAG_CLUSTER_ID) {
            props.cluster_id = Some(r.read_short_str()?);
        }
        Ok(props)
    }
}

/// Payload of a content-header frame
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn encode(&self, w: &mut FieldWriter) -> ProtocolResult<()> {
        w.put_u16(self.class_id);
        w.put_u16(0); // weight
        w.put_u64(self.body_size);
        self.properties.encode(w)
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let mut r = FieldReader::new(payload);
        let class_id = r.read_u16()?;
        let _weight = r.read_u16()?;
        let body_size = r.read_u64()?;
        let properties = BasicProperties::decode(&mut r)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }
}
