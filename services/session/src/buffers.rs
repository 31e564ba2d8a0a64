//! Retention-bounded message buffers
//!
//! Three buffers share one retention limit:
//!
//! | Buffer | Order | Holds |
//! |--------|-------|-------|
//! | live history | most recent first | basic deliveries |
//! | paused buffer | receipt order | deliveries that arrived while paused |
//! | durable history | most recent first | display copies of stream deliveries |
//!
//! Durable deliveries also sit in the acknowledgement table keyed by message
//! id until an action consumes them. Trimming a durable display copy evicts
//! its table entry in the same step and releases the adapter handle.

use mq_types::{AcknowledgeableMessage, MessageId, UnifiedMessage};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug)]
pub struct MessageLog {
    live: VecDeque<UnifiedMessage>,
    paused: VecDeque<UnifiedMessage>,
    durable: VecDeque<UnifiedMessage>,
    pending: HashMap<MessageId, AcknowledgeableMessage>,
    retention: usize,
}

impl MessageLog {
    pub fn new(retention: usize) -> Self {
        Self {
            live: VecDeque::new(),
            paused: VecDeque::new(),
            durable: VecDeque::new(),
            pending: HashMap::new(),
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Change the limit and trim every buffer right away
    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention.max(1);
        self.trim();
    }

    pub fn push_live(&mut self, message: UnifiedMessage) {
        self.live.push_front(message);
        self.trim_live();
    }

    pub fn push_paused(&mut self, message: UnifiedMessage) {
        self.paused.push_back(message);
        self.trim_paused();
    }

    /// Move the paused buffer into live history; returns how many moved
    pub fn resume(&mut self) -> usize {
        let moved = self.paused.len();
        while let Some(message) = self.paused.pop_front() {
            self.live.push_front(message);
        }
        self.trim_live();
        moved
    }

    pub fn push_durable(&mut self, message: AcknowledgeableMessage) {
        let display = message.message().clone();
        self.pending.insert(display.id(), message);
        self.durable.push_front(display);
        self.trim_durable();
    }

    /// The acknowledgeable delivery behind `id`, if it still has a handle
    pub fn pending(&self, id: MessageId) -> Option<AcknowledgeableMessage> {
        self.pending.get(&id).cloned()
    }

    pub fn remove_pending(&mut self, id: MessageId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn live(&self) -> Vec<UnifiedMessage> {
        self.live.iter().cloned().collect()
    }

    pub fn paused(&self) -> Vec<UnifiedMessage> {
        self.paused.iter().cloned().collect()
    }

    pub fn durable(&self) -> Vec<UnifiedMessage> {
        self.durable.iter().cloned().collect()
    }

    pub fn clear_live(&mut self) {
        self.live.clear();
    }

    /// Empty every buffer and release every pending handle
    pub fn clear(&mut self) {
        self.live.clear();
        self.paused.clear();
        self.durable.clear();
        for (_, message) in self.pending.drain() {
            message.release();
        }
    }

    fn trim(&mut self) {
        self.trim_live();
        self.trim_paused();
        self.trim_durable();
    }

    fn trim_live(&mut self) {
        self.live.truncate(self.retention);
    }

    // Oldest paused deliveries go first
    fn trim_paused(&mut self) {
        while self.paused.len() > self.retention {
            self.paused.pop_front();
        }
    }

    fn trim_durable(&mut self) {
        while self.durable.len() > self.retention {
            let Some(evicted) = self.durable.pop_back() else {
                break;
            };
            if let Some(message) = self.pending.remove(&evicted.id()) {
                let released = message.release();
                debug!(
                    stream = %message.metadata().stream,
                    sequence = message.metadata().stream_sequence,
                    released,
                    "Evicted durable delivery"
                );
            }
        }
    }
}
