//! # mqtap AMQP Codec
//!
//! ## Purpose
//!
//! Bit-exact AMQP 0-9-1 wire codec for the AMQP adapter:
//! - Frame encoding (method, content header, body, heartbeat)
//! - Resumable frame decoding across arbitrary read boundaries
//! - Method argument codec including packed bit fields
//! - Field tables with the RabbitMQ value type set
//! - Basic-class content properties
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → services/adapters (amqp)
//!     ↑           ↓              ↓
//! BrokerError  Frames /     Socket reader/writer
//!              Methods      tasks, channels, RPC
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling
//! - Channel state, RPC correlation or delivery reassembly
//!
//! ## Example
//!
//! ```rust
//! use mq_codec::{Frame, FrameDecoder, Method};
//!
//! let bytes = Frame::method(1, Method::ChannelOpen).encode().unwrap();
//! let mut decoder = FrameDecoder::new();
//! decoder.feed(&bytes[..3]);
//! assert!(decoder.next_frame().unwrap().is_none());
//! decoder.feed(&bytes[3..]);
//! assert_eq!(decoder.next_frame().unwrap(), Some(Frame::method(1, Method::ChannelOpen)));
//! ```

pub mod buffers;
pub mod constants;
pub mod error;
pub mod frame;
pub mod methods;
pub mod parser;
pub mod properties;
pub mod table;

pub use buffers::{FieldReader, FieldWriter};
pub use constants::PROTOCOL_HEADER;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{body_chunk_size, encode_publish, Frame};
pub use methods::Method;
pub use parser::FrameDecoder;
pub use properties::{BasicProperties, ContentHeader};
pub use table::{FieldTable, FieldValue};
