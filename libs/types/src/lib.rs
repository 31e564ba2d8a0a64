//! # mqtap Unified Types Library
//!
//! Shared vocabulary for every broker adapter and the connection orchestrator.
//!
//! ## Design Philosophy
//!
//! - **One message shape**: every backend (NATS, JetStream, Kafka, AMQP, Redis)
//!   yields [`UnifiedMessage`] values; broker specifics ride along as headers
//! - **Closed error taxonomy**: adapters convert their layer errors into
//!   [`BrokerError`] before anything leaves the adapter boundary
//! - **At-most-once acknowledgement**: [`AcknowledgeableMessage`] routes its
//!   actions through an [`Acknowledger`] keyed by an opaque [`AckHandle`]
//!
//! ## Integration Points
//!
//! ```text
//! libs/types → libs/codec (AMQP frames) → services/adapters → services/session
//!     ↑                                         ↓                    ↓
//! Pure data                              BasicClient /          history, dedup,
//! + errors                               StreamingClient        pause buffer
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use mq_types::UnifiedMessage;
//!
//! let msg = UnifiedMessage::new("orders.created", "{\"id\":1}")
//!     .with_header("content-type", "application/json");
//! assert_eq!(msg.size(), 8);
//! assert_eq!(msg.header("content-type"), Some("application/json"));
//! ```

pub mod ack;
pub mod connection;
pub mod error;
pub mod message;
pub mod streaming;

pub use ack::{
    take_or_unavailable, AckAction, AckArena, AckHandle, AcknowledgeableMessage, Acknowledger,
    MessageMetadata,
};
pub use connection::{ConnectionConfig, ConnectionState};
pub use error::{BrokerError, BrokerResult};
pub use message::{Headers, MessageId, UnifiedMessage};
pub use streaming::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, PublishAck, ReplayPolicy,
    RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamState,
};
