//! # mqtap Session - Connection Orchestrator
//!
//! ## Purpose
//!
//! Drives one broker connection through the adapter layer and keeps what an
//! observer needs to watch it: a retention-bounded history, a pause buffer,
//! duplicate suppression for partitioned-log redeliveries and, in durable
//! stream mode, the table of deliveries still waiting for acknowledgement.
//!
//! ## Architecture Role
//!
//! ```text
//! mqtap CLI / UI ──► ConnectionManager ──► ProviderRegistry ──► adapter
//!        ▲                  │
//!        └── snapshots ◄────┘ (messages, paused, durable, events, stats)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use mq_config::SessionSettings;
//! use mq_session::{ConnectRequest, ConnectionManager};
//!
//! # async fn demo() -> mq_types::BrokerResult<()> {
//! let manager = ConnectionManager::new(SessionSettings::default());
//! manager.connect(ConnectRequest::new("nats://127.0.0.1:4222")).await?;
//! manager.subscribe("orders.>").await?;
//! for message in manager.messages() {
//!     println!("{} {}", message.subject(), message.payload_str());
//! }
//! manager.disconnect().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod buffers;
pub mod cli;
pub mod dedup;
pub mod events;
pub mod manager;

pub use buffers::MessageLog;
pub use dedup::{DedupKey, DedupWindow};
pub use events::{EventLevel, EventLog, SessionEvent, SessionStats};
pub use manager::{
    resolve_provider, ConnectRequest, ConnectionManager, ConnectionSummary, SessionMode,
};
