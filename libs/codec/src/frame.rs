//! Frame model and encoders
//!
//! Wire layout: `type:u8 | channel:u16 | size:u32 | payload | 0xCE`.

use crate::buffers::FieldWriter;
use crate::constants::{
    class, FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT, FRAME_METHOD, FRAME_OVERHEAD,
    FRAME_MIN_SIZE,
};
use crate::error::ProtocolResult;
use crate::methods::Method;
use crate::properties::{BasicProperties, ContentHeader};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method { channel: u16, method: Method },
    Header { channel: u16, header: ContentHeader },
    Body { channel: u16, payload: Bytes },
    Heartbeat,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Self::Method { channel, method }
    }

    pub fn channel(&self) -> u16 {
        match self {
            Self::Method { channel, .. } | Self::Header { channel, .. } | Self::Body { channel, .. } => {
                *channel
            }
            Self::Heartbeat => 0,
        }
    }

    pub fn frame_type(&self) -> u8 {
        match self {
            Self::Method { .. } => FRAME_METHOD,
            Self::Header { .. } => FRAME_HEADER,
            Self::Body { .. } => FRAME_BODY,
            Self::Heartbeat => FRAME_HEARTBEAT,
        }
    }

    /// Append the encoded frame to `out`
    pub fn encode_into(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        match self {
            Self::Method { channel, method } => {
                let payload = method.encode()?;
                put_frame(out, FRAME_METHOD, *channel, &payload);
            }
            Self::Header { channel, header } => {
                let mut w = FieldWriter::with_capacity(32);
                header.encode(&mut w)?;
                put_frame(out, FRAME_HEADER, *channel, w.as_slice());
            }
            Self::Body { channel, payload } => put_frame(out, FRAME_BODY, *channel, payload),
            Self::Heartbeat => put_frame(out, FRAME_HEARTBEAT, 0, &[]),
        }
        Ok(())
    }

    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut out = BytesMut::new();
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }
}

fn put_frame(out: &mut BytesMut, frame_type: u8, channel: u16, payload: &[u8]) {
    out.reserve(FRAME_OVERHEAD + payload.len());
    out.put_u8(frame_type);
    out.put_u16(channel);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.put_u8(FRAME_END);
}

/// Encode a complete publish: method, content header and body frames
///
/// The frames come back as one buffer so a single writer can emit them
/// without another channel's frames landing in between. Body frames carry at
/// most `frame_max - 8` bytes; an empty body produces no body frame.
pub fn encode_publish(
    channel: u16,
    exchange: &str,
    routing_key: &str,
    properties: BasicProperties,
    body: &[u8],
    frame_max: u32,
) -> ProtocolResult<Bytes> {
    let mut out = BytesMut::with_capacity(body.len() + 256);
    Frame::method(
        channel,
        Method::BasicPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: false,
            immediate: false,
        },
    )
    .encode_into(&mut out)?;

    Frame::Header {
        channel,
        header: ContentHeader {
            class_id: class::BASIC,
            body_size: body.len() as u64,
            properties,
        },
    }
    .encode_into(&mut out)?;

    let chunk = body_chunk_size(frame_max);
    for piece in body.chunks(chunk) {
        put_frame(&mut out, FRAME_BODY, channel, piece);
    }

    Ok(out.freeze())
}

/// Largest body payload that fits into one frame of `frame_max` bytes
pub fn body_chunk_size(frame_max: u32) -> usize {
    let frame_max = frame_max.max(FRAME_MIN_SIZE) as usize;
    frame_max - FRAME_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_HEADER_SIZE;

    #[test]
    fn test_heartbeat_bytes() {
        let bytes = Frame::Heartbeat.encode().unwrap();
        assert_eq!(&bytes[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn test_method_frame_layout() {
        let bytes = Frame::method(1, Method::ChannelOpen).encode().unwrap();
        assert_eq!(bytes[0], FRAME_METHOD);
        assert_eq!(&bytes[1..3], &[0, 1]);
        let size = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + size + 1);
        assert_eq!(*bytes.last().unwrap(), FRAME_END);
    }

    #[test]
    fn test_publish_splits_body() {
        let body = vec![7u8; 10_000];
        let frames = encode_publish(
            1,
            "",
            "orders.created",
            BasicProperties::default(),
            &body,
            FRAME_MIN_SIZE,
        )
        .unwrap();

        let mut decoder = crate::parser::FrameDecoder::new();
        decoder.feed(&frames);
        let mut bodies = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            if let Frame::Body { payload, .. } = frame {
                bodies.push(payload.len());
            }
        }
        assert_eq!(bodies, vec![4088, 4088, 1824]);
    }

    #[test]
    fn test_empty_body_has_no_body_frame() {
        let frames =
            encode_publish(1, "amq.topic", "a.b", BasicProperties::default(), &[], 131_072)
                .unwrap();
        let mut decoder = crate::parser::FrameDecoder::new();
        decoder.feed(&frames);
        let mut count = 0;
        while decoder.next_frame().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
