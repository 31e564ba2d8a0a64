//! # Resumable Frame Decoder
//!
//! Bytes arrive from the socket in arbitrary chunks. [`FrameDecoder`] buffers
//! them and yields complete frames; a frame split across any number of reads
//! decodes exactly as if it had arrived in one piece.
//!
//! Violations are reported instead of skipped: a wrong frame-end octet, an
//! unknown frame type, or a frame larger than the negotiated maximum leaves
//! the stream unusable and the caller is expected to drop the connection.

use crate::constants::{
    FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEADER_SIZE, FRAME_HEARTBEAT, FRAME_MAX_CEILING,
    FRAME_METHOD, FRAME_OVERHEAD, PROTOCOL_HEADER,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;
use crate::methods::Method;
use crate::properties::ContentHeader;
use bytes::{Buf, BytesMut};
use tracing::trace;

#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder accepting frames up to the client ceiling until tuning completes
    pub fn new() -> Self {
        Self::with_max_frame_size(FRAME_MAX_CEILING)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size: max_frame_size as usize,
        }
    }

    /// Apply the negotiated frame-max
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size as usize;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        // A server that does not accept our version answers with its own header.
        if self.buf[0] == PROTOCOL_HEADER[0] {
            if self.buf.len() < PROTOCOL_HEADER.len() {
                return Ok(None);
            }
            if self.buf[..4] == PROTOCOL_HEADER[..4] {
                return Err(ProtocolError::VersionRejected {
                    major: self.buf[5],
                    minor: self.buf[6],
                    revision: self.buf[7],
                });
            }
        }

        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = self.buf[0];
        if !matches!(
            frame_type,
            FRAME_METHOD | FRAME_HEADER | FRAME_BODY | FRAME_HEARTBEAT
        ) {
            return Err(ProtocolError::UnknownFrameType { frame_type });
        }

        let channel = u16::from_be_bytes([self.buf[1], self.buf[2]]);
        let size = u32::from_be_bytes([self.buf[3], self.buf[4], self.buf[5], self.buf[6]]) as usize;
        if size + FRAME_OVERHEAD > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: size + FRAME_OVERHEAD,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + size + 1;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let found = self.buf[total - 1];
        if found != FRAME_END {
            return Err(ProtocolError::FrameEndMismatch {
                found,
                frame_type,
                channel,
            });
        }

        self.buf.advance(FRAME_HEADER_SIZE);
        let payload = self.buf.split_to(size).freeze();
        self.buf.advance(1);

        let frame = match frame_type {
            FRAME_METHOD => Frame::Method {
                channel,
                method: Method::decode(&payload)?,
            },
            FRAME_HEADER => Frame::Header {
                channel,
                header: ContentHeader::decode(&payload)?,
            },
            FRAME_BODY => Frame::Body { channel, payload },
            _ => Frame::Heartbeat,
        };

        trace!(frame_type, channel, size, "decoded frame");
        Ok(Some(frame))
    }
}
