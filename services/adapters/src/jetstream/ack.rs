//! Acknowledgement subjects and the arena-backed acker
//!
//! Every pulled message carries a `$JS.ACK.…` reply subject encoding its
//! delivery metadata. Acting on a message publishes one of the ack payloads
//! to that subject; the subject itself lives in an [`AckArena`] so each
//! message is acted on at most once.

use crate::nats::NatsConnection;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use mq_types::{
    take_or_unavailable, AckAction, AckArena, AckHandle, Acknowledger, BrokerError, BrokerResult,
    MessageMetadata,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;
use tracing::debug;

const ACK_PREFIX: &str = "$JS.ACK.";
const NO_DOMAIN: &str = "_";

/// Delivery metadata decoded from an ack reply subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReply {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub pending: u64,
}

impl AckReply {
    /// Parse the v1 (9 tokens) or v2 (11/12 tokens, with domain and
    /// account hash) layout
    pub fn parse(subject: &str) -> Option<Self> {
        if !subject.starts_with(ACK_PREFIX) {
            return None;
        }
        let tokens: Vec<&str> = subject.split('.').collect();
        let (domain, rest) = match tokens.len() {
            9 => (None, &tokens[2..]),
            11 | 12 => {
                let domain = Some(tokens[2])
                    .filter(|d| *d != NO_DOMAIN && !d.is_empty())
                    .map(str::to_string);
                (domain, &tokens[4..])
            }
            _ => return None,
        };

        let number = |i: usize| rest.get(i).and_then(|t| t.parse::<u64>().ok());
        let nanos = rest.get(5).and_then(|t| t.parse::<i64>().ok())?;
        Some(Self {
            domain,
            stream: rest[0].to_string(),
            consumer: rest[1].to_string(),
            delivered: number(2)?,
            stream_sequence: number(3)?,
            consumer_sequence: number(4)?,
            timestamp: Utc.timestamp_nanos(nanos),
            pending: number(6)?,
        })
    }

    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            stream: self.stream.clone(),
            consumer: self.consumer.clone(),
            stream_sequence: self.stream_sequence,
            consumer_sequence: self.consumer_sequence,
            delivered: self.delivered,
            pending: self.pending,
            timestamp: self.timestamp,
        }
    }
}

/// Wire payload of an acknowledgement action
pub fn ack_payload(action: AckAction) -> Bytes {
    match action {
        AckAction::Ack => Bytes::from_static(b"+ACK"),
        AckAction::Nak(None) => Bytes::from_static(b"-NAK"),
        AckAction::Nak(Some(delay)) => {
            Bytes::from(format!("-NAK {{\"delay\":{}}}", delay.as_nanos()))
        }
        AckAction::Term => Bytes::from_static(b"+TERM"),
        AckAction::InProgress => Bytes::from_static(b"+WPI"),
    }
}

/// Publishes acknowledgements for messages pulled over one connection
pub struct JetStreamAcker {
    connection: Weak<NatsConnection>,
    pending: Mutex<AckArena<String>>,
}

impl JetStreamAcker {
    pub fn new(connection: Weak<NatsConnection>) -> Self {
        Self {
            connection,
            pending: Mutex::new(AckArena::new()),
        }
    }

    /// Register the reply subject of a freshly pulled message
    pub fn track(&self, reply_subject: String) -> AckHandle {
        self.pending.lock().insert(reply_subject)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl fmt::Debug for JetStreamAcker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JetStreamAcker")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn acknowledge(&self, handle: AckHandle, action: AckAction) -> BrokerResult<()> {
        let reply = take_or_unavailable(&mut self.pending.lock(), handle)?;
        let Some(connection) = self.connection.upgrade() else {
            self.pending.lock().restore(handle, reply);
            return Err(BrokerError::NotConnected);
        };
        match connection.publish(&reply, None, None, &ack_payload(action)) {
            Ok(()) => {
                debug!(action = action.name(), reply = %reply, "Acknowledged");
                Ok(())
            }
            Err(e) => {
                self.pending.lock().restore(handle, reply);
                Err(e)
            }
        }
    }

    fn release(&self, handle: AckHandle) -> bool {
        self.pending.lock().release(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_parse_v1_subject() {
        let reply = AckReply::parse("$JS.ACK.ORDERS.tap.2.41.7.1709287200000000000.3").unwrap();
        assert_eq!(reply.domain, None);
        assert_eq!(reply.stream, "ORDERS");
        assert_eq!(reply.consumer, "tap");
        assert_eq!(reply.delivered, 2);
        assert_eq!(reply.stream_sequence, 41);
        assert_eq!(reply.consumer_sequence, 7);
        assert_eq!(reply.pending, 3);
        assert_eq!(reply.timestamp.timestamp(), 1_709_287_200);
    }

    #[test]
    fn test_parse_v2_subject() {
        let reply =
            AckReply::parse("$JS.ACK.hub.ACCHASH.ORDERS.tap.1.5.5.1709287200000000000.0.xyz").unwrap();
        assert_eq!(reply.domain.as_deref(), Some("hub"));
        assert_eq!(reply.stream, "ORDERS");
        assert_eq!(reply.stream_sequence, 5);

        let reply = AckReply::parse("$JS.ACK._.ACCHASH.ORDERS.tap.1.5.5.1709287200000000000.0").unwrap();
        assert_eq!(reply.domain, None);
        assert_eq!(reply.pending, 0);
    }

    #[test]
    fn test_reject_foreign_subjects() {
        assert!(AckReply::parse("_INBOX.abc.1").is_none());
        assert!(AckReply::parse("$JS.ACK.ORDERS.tap.x.1.1.1.0").is_none());
        assert!(AckReply::parse("$JS.ACK.ORDERS.tap.1.1").is_none());
    }

    #[test]
    fn test_ack_payloads() {
        assert_eq!(ack_payload(AckAction::Ack), Bytes::from_static(b"+ACK"));
        assert_eq!(ack_payload(AckAction::Nak(None)), Bytes::from_static(b"-NAK"));
        assert_eq!(
            ack_payload(AckAction::Nak(Some(Duration::from_secs(2)))),
            Bytes::from_static(b"-NAK {\"delay\":2000000000}")
        );
        assert_eq!(ack_payload(AckAction::Term), Bytes::from_static(b"+TERM"));
        assert_eq!(ack_payload(AckAction::InProgress), Bytes::from_static(b"+WPI"));
    }

    #[tokio::test]
    async fn test_handle_rearmed_without_connection() {
        let acker = Arc::new(JetStreamAcker::new(Weak::new()));
        let handle = acker.track("$JS.ACK.ORDERS.tap.1.1.1.0.0".into());
        assert_eq!(
            acker.acknowledge(handle, AckAction::Ack).await,
            Err(BrokerError::NotConnected)
        );
        assert_eq!(acker.pending_count(), 1);
        assert_eq!(
            acker.acknowledge(handle, AckAction::Term).await,
            Err(BrokerError::NotConnected)
        );

        assert!(acker.release(handle));
        assert_eq!(
            acker.acknowledge(handle, AckAction::Ack).await,
            Err(BrokerError::message_unavailable())
        );
    }

    #[test]
    fn test_release_forgets_handle() {
        let acker = JetStreamAcker::new(Weak::new());
        let handle = acker.track("$JS.ACK.ORDERS.tap.1.1.1.0.0".into());
        assert_eq!(acker.pending_count(), 1);
        assert!(acker.release(handle));
        assert!(!acker.release(handle));
        assert_eq!(acker.pending_count(), 0);
    }
}
