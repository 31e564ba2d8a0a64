//! Acknowledgement contract for persistent-stream messages
//!
//! An [`AcknowledgeableMessage`] carries an opaque [`AckHandle`]; the adapter
//! that produced it keeps the real per-message state in an [`AckArena`]. The
//! first successful action takes the entry out of the arena, so every later
//! action on the same handle (from any clone of the message) fails with
//! [`BrokerError::message_unavailable`].

use crate::error::{BrokerError, BrokerResult};
use crate::message::UnifiedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque id of a pending acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckHandle(u64);

impl AckHandle {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    /// Negative acknowledgement with an optional redelivery delay
    Nak(Option<Duration>),
    Term,
    InProgress,
}

impl AckAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak(_) => "nak",
            Self::Term => "term",
            Self::InProgress => "in_progress",
        }
    }
}

/// Adapter-side sink for acknowledgement actions
#[async_trait]
pub trait Acknowledger: Send + Sync + fmt::Debug {
    /// Perform `action` for `handle`; fails with `message no longer available`
    /// when the handle was already consumed or released
    async fn acknowledge(&self, handle: AckHandle, action: AckAction) -> BrokerResult<()>;

    /// Drop a pending entry without telling the broker; the broker
    /// redelivers after its ack wait
    fn release(&self, _handle: AckHandle) -> bool {
        false
    }
}

/// Table of pending acknowledgements keyed by [`AckHandle`]
///
/// Not synchronized: owners keep it inside their adapter-scoped lock.
#[derive(Debug)]
pub struct AckArena<T> {
    next: u64,
    entries: HashMap<u64, T>,
}

impl<T> Default for AckArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AckArena<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entry: T) -> AckHandle {
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, entry);
        AckHandle(id)
    }

    /// Remove the entry; `None` once any action has consumed it
    pub fn take(&mut self, handle: AckHandle) -> Option<T> {
        self.entries.remove(&handle.0)
    }

    /// Put an entry back after an action failed before reaching the broker
    pub fn restore(&mut self, handle: AckHandle, entry: T) {
        self.entries.insert(handle.0, entry);
    }

    pub fn release(&mut self, handle: AckHandle) -> bool {
        self.entries.remove(&handle.0).is_some()
    }

    pub fn contains(&self, handle: AckHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Delivery metadata of a persistent-stream message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub stream: String,
    pub consumer: String,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub delivered: u64,
    pub pending: u64,
    pub timestamp: DateTime<Utc>,
}

/// A message that must be acknowledged at most once
#[derive(Clone)]
pub struct AcknowledgeableMessage {
    message: UnifiedMessage,
    metadata: MessageMetadata,
    handle: AckHandle,
    acker: Arc<dyn Acknowledger>,
}

impl AcknowledgeableMessage {
    pub fn new(
        message: UnifiedMessage,
        metadata: MessageMetadata,
        handle: AckHandle,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            message,
            metadata,
            handle,
            acker,
        }
    }

    pub fn message(&self) -> &UnifiedMessage {
        &self.message
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn handle(&self) -> AckHandle {
        self.handle
    }

    /// Forget the pending acknowledgement; later actions fail
    pub fn release(&self) -> bool {
        self.acker.release(self.handle)
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.acknowledge(self.handle, AckAction::Ack).await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> BrokerResult<()> {
        self.acker.acknowledge(self.handle, AckAction::Nak(delay)).await
    }

    pub async fn term(&self) -> BrokerResult<()> {
        self.acker.acknowledge(self.handle, AckAction::Term).await
    }

    pub async fn in_progress(&self) -> BrokerResult<()> {
        self.acker
            .acknowledge(self.handle, AckAction::InProgress)
            .await
    }
}

impl fmt::Debug for AcknowledgeableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgeableMessage")
            .field("message", &self.message)
            .field("metadata", &self.metadata)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Convenience for acknowledgers backed by an [`AckArena`]
pub fn take_or_unavailable<T>(arena: &mut AckArena<T>, handle: AckHandle) -> BrokerResult<T> {
    arena.take(handle).ok_or_else(BrokerError::message_unavailable)
}
