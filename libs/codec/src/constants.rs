//! # AMQP 0-9-1 Constants
//!
//! Frame types, class ids, reply codes and negotiation limits. These values
//! are fixed by the protocol and must stay bit-exact.

/// Protocol header sent by the client before any frame
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

/// Terminal octet of every frame
pub const FRAME_END: u8 = 0xCE;

/// Type (1) + channel (2) + size (4)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Header plus frame-end octet; body chunks are `frame_max - FRAME_OVERHEAD`
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Smallest frame-max a peer may negotiate
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Client-side ceiling applied to the server's frame-max during tuning
pub const FRAME_MAX_CEILING: u32 = 131_072;

/// Channel-max used when the server proposes 0 (no limit)
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
}

pub mod reply {
    pub const SUCCESS: u16 = 200;
    pub const NOT_FOUND: u16 = 404;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const CONNECTION_FORCED: u16 = 320;
}

/// Persistent delivery mode for content headers
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
