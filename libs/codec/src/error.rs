//! Protocol-level errors for AMQP frame processing
//!
//! Each variant carries enough context to tell a truncated read apart from a
//! peer that is not speaking AMQP 0-9-1 at all.

use mq_types::BrokerError;
use thiserror::Error;

/// AMQP codec errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame did not terminate with the frame-end octet
    #[error("Frame end mismatch: expected 0xCE, got {found:#04x} (frame type {frame_type}, channel {channel})")]
    FrameEndMismatch {
        found: u8,
        frame_type: u8,
        channel: u16,
    },

    /// Frame type octet is not method, header, body or heartbeat
    #[error("Unknown frame type {frame_type}")]
    UnknownFrameType { frame_type: u8 },

    /// Declared frame size exceeds the negotiated maximum
    #[error("Frame too large: {size} bytes exceeds limit {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Payload ended before a field could be read
    #[error("Truncated {context}: need {need} bytes, got {got}")]
    Truncated {
        context: &'static str,
        need: usize,
        got: usize,
    },

    /// Class/method pair is not part of the supported method set
    #[error("Unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },

    /// Field table value carries an unknown type tag
    #[error("Unknown field value type {tag:#04x} for key '{key}'")]
    UnknownFieldType { tag: u8, key: String },

    /// Server answered the protocol header with its own version
    #[error("Protocol version rejected: server speaks {major}.{minor}.{revision}")]
    VersionRejected { major: u8, minor: u8, revision: u8 },

    /// Short strings are limited to 255 bytes
    #[error("Short string too long: {len} bytes (max 255) in {context}")]
    ShortStringTooLong { len: usize, context: &'static str },

    /// String field is not valid UTF-8
    #[error("Invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    /// Frame arrived in a state where it is not allowed
    #[error("Unexpected frame: {message}")]
    UnexpectedFrame { message: String },
}

/// Result type for codec operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    pub fn truncated(context: &'static str, need: usize, got: usize) -> Self {
        Self::Truncated { context, need, got }
    }

    pub fn unknown_method(class_id: u16, method_id: u16) -> Self {
        Self::UnknownMethod {
            class_id,
            method_id,
        }
    }

    pub fn unexpected_frame(message: impl Into<String>) -> Self {
        Self::UnexpectedFrame {
            message: message.into(),
        }
    }

    /// Whether the byte stream can no longer be trusted after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ShortStringTooLong { .. })
    }
}

impl From<ProtocolError> for BrokerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::VersionRejected { .. } => BrokerError::ConnectionFailed(err.to_string()),
            ProtocolError::ShortStringTooLong { .. } => {
                BrokerError::InvalidConfiguration(err.to_string())
            }
            other => BrokerError::ProviderError(format!("AMQP protocol error: {}", other)),
        }
    }
}
