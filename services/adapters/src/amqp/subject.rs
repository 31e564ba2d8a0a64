//! Subject addressing and message conversion for AMQP
//!
//! A subject is either `"exchange/routingKey"` or a bare routing key on the
//! default exchange.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use mq_codec::{BasicProperties, FieldTable, FieldValue};
use mq_types::{BrokerError, BrokerResult, Headers, UnifiedMessage};

pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const EXCHANGE_HEADER: &str = "amqp.exchange";
pub const DELIVERY_TAG_HEADER: &str = "amqp.delivery_tag";
pub const REDELIVERED_HEADER: &str = "amqp.redelivered";
const CORRELATION_ID_HEADER: &str = "amqp.correlation_id";
const MESSAGE_ID_HEADER: &str = "amqp.message_id";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpTarget {
    /// Empty for the default exchange
    pub exchange: String,
    pub routing_key: String,
}

impl AmqpTarget {
    pub fn parse(subject: &str) -> BrokerResult<Self> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(BrokerError::invalid_configuration("empty AMQP subject"));
        }
        let (exchange, routing_key) = match subject.split_once('/') {
            Some((exchange, routing_key)) => (exchange, routing_key),
            None => ("", subject),
        };
        if exchange.is_empty() && routing_key.is_empty() {
            return Err(BrokerError::invalid_configuration(format!(
                "invalid AMQP subject '{}'",
                subject
            )));
        }
        Ok(Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    pub fn is_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }

    /// Queue a subscription declares for this target
    ///
    /// The default exchange routes by queue name, so the queue takes the
    /// routing key. Names under `amq.` are reserved by the broker, hence the
    /// prefix for exchange-bound queues.
    pub fn queue_name(&self, suffix: &str) -> String {
        if self.is_default_exchange() {
            self.routing_key.clone()
        } else {
            format!("mqtap.{}.{}.{}", self.exchange, self.routing_key, suffix)
        }
    }
}

/// Content properties for an outgoing message
pub fn publish_properties(message: &UnifiedMessage) -> BasicProperties {
    let content_type = message
        .header(CONTENT_TYPE_HEADER)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let headers: FieldTable = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter(|(key, _)| key.as_str() != CONTENT_TYPE_HEADER)
                .map(|(key, value)| (key.clone(), FieldValue::string(value.as_str())))
                .collect()
        })
        .unwrap_or_default();

    BasicProperties {
        content_type: Some(content_type),
        headers: Some(headers).filter(|h| !h.is_empty()),
        reply_to: message.reply_to().map(str::to_string),
        timestamp: u64::try_from(message.timestamp().timestamp()).ok(),
        ..BasicProperties::default()
    }
}

/// Routing facts of one delivery
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Build the unified message for a reassembled delivery
pub fn delivery_message(
    info: &DeliveryInfo,
    properties: &BasicProperties,
    body: Bytes,
) -> UnifiedMessage {
    let mut headers = Headers::new();
    if let Some(table) = &properties.headers {
        for (key, value) in table {
            headers.insert(key.clone(), value.to_display_string());
        }
    }
    if let Some(content_type) = &properties.content_type {
        headers.insert(CONTENT_TYPE_HEADER.to_string(), content_type.clone());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.clone());
    }
    if let Some(message_id) = &properties.message_id {
        headers.insert(MESSAGE_ID_HEADER.to_string(), message_id.clone());
    }
    headers.insert(EXCHANGE_HEADER.to_string(), info.exchange.clone());
    headers.insert(DELIVERY_TAG_HEADER.to_string(), info.delivery_tag.to_string());
    headers.insert(REDELIVERED_HEADER.to_string(), info.redelivered.to_string());

    let mut message = UnifiedMessage::new(info.routing_key.clone(), body).with_headers(headers);
    if let Some(reply_to) = &properties.reply_to {
        message = message.with_reply_to(reply_to.clone());
    }
    if let Some(ts) = properties
        .timestamp
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    {
        message = message.with_timestamp(ts);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subject_forms() {
        let bare = AmqpTarget::parse("orders.created").unwrap();
        assert!(bare.is_default_exchange());
        assert_eq!(bare.routing_key, "orders.created");
        assert_eq!(bare.queue_name("x"), "orders.created");

        let routed = AmqpTarget::parse("amq.topic/#").unwrap();
        assert_eq!(routed.exchange, "amq.topic");
        assert_eq!(routed.routing_key, "#");
        assert_eq!(routed.queue_name("ab12"), "mqtap.amq.topic.#.ab12");

        assert!(AmqpTarget::parse("  ").is_err());
        assert!(AmqpTarget::parse("/").is_err());
    }

    #[test]
    fn test_publish_properties_carry_headers() {
        let msg = UnifiedMessage::new("k", "x")
            .with_header("content-type", "application/json")
            .with_header("trace", "abc")
            .with_reply_to("replies");
        let props = publish_properties(&msg);

        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.reply_to.as_deref(), Some("replies"));
        let headers = props.headers.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["trace"].as_str(), Some("abc"));
        assert!(props.timestamp.is_some());
    }

    #[test]
    fn test_publish_properties_default_content_type() {
        let props = publish_properties(&UnifiedMessage::new("k", "x"));
        assert_eq!(props.content_type.as_deref(), Some(DEFAULT_CONTENT_TYPE));
        assert!(props.headers.is_none());
    }

    #[test]
    fn test_delivery_message_headers() {
        let info = DeliveryInfo {
            consumer_tag: "mq-1".into(),
            delivery_tag: 7,
            redelivered: true,
            exchange: "amq.topic".into(),
            routing_key: "orders.created".into(),
        };
        let mut table = FieldTable::new();
        table.insert("retries".into(), FieldValue::I32(3));
        let props = BasicProperties {
            content_type: Some("text/plain".into()),
            headers: Some(table),
            timestamp: Some(1_700_000_000),
            ..BasicProperties::default()
        };

        let msg = delivery_message(&info, &props, Bytes::from_static(b"hi"));
        assert_eq!(msg.subject(), "orders.created");
        assert_eq!(msg.header("retries"), Some("3"));
        assert_eq!(msg.header(CONTENT_TYPE_HEADER), Some("text/plain"));
        assert_eq!(msg.header(EXCHANGE_HEADER), Some("amq.topic"));
        assert_eq!(msg.header(DELIVERY_TAG_HEADER), Some("7"));
        assert_eq!(msg.header(REDELIVERED_HEADER), Some("true"));
        assert_eq!(msg.timestamp().timestamp(), 1_700_000_000);
    }
}
