//! Session event log and intake counters

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        })
    }
}

/// One line of the human-facing session history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

/// Bounded, oldest-first list of [`SessionEvent`]s
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SessionEvent>,
    limit: usize,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, level: EventLevel, message: impl Into<String>) {
        self.events.push_back(SessionEvent {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        while self.events.len() > self.limit {
            self.events.pop_front();
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(EventLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(EventLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(EventLevel::Error, message);
    }

    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Intake counters since the session was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub duplicates_suppressed: u64,
}

impl SessionStats {
    pub fn record(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_suppressed += 1;
    }
}
