//! Duplicate suppression for partitioned-log deliveries
//!
//! Only messages carrying both `kafka.partition` and `kafka.offset` headers
//! have an identity; everything else passes through untouched. The window
//! remembers a bounded number of keys and forgets the oldest first.

use mq_adapters::kafka::{HEADER_OFFSET, HEADER_PARTITION};
use mq_types::UnifiedMessage;
use std::collections::{HashSet, VecDeque};

/// Identity of one partitioned-log record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub topic: String,
    pub partition: String,
    pub offset: String,
}

impl DedupKey {
    /// `None` when the message has no partition/offset identity
    pub fn of(message: &UnifiedMessage) -> Option<Self> {
        let partition = message.header(HEADER_PARTITION)?;
        let offset = message.header(HEADER_OFFSET)?;
        Some(Self {
            topic: message.subject().to_string(),
            partition: partition.to_string(),
            offset: offset.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record the message; true when it was already seen inside the window
    pub fn is_duplicate(&mut self, message: &UnifiedMessage) -> bool {
        let Some(key) = DedupKey::of(message) else {
            return false;
        };
        if self.seen.contains(&key) {
            return true;
        }

        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
