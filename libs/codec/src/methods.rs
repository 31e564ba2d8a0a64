//! AMQP method frames
//!
//! The subset of the 0-9-1 method set a pub/sub client needs: connection and
//! channel lifecycle, exchange/queue declaration, binding, and basic
//! qos/consume/cancel/publish/return/deliver. Reserved arguments are written
//! as zero values and skipped when reading.

use crate::buffers::{FieldReader, FieldWriter};
use crate::constants::class;
use crate::error::{ProtocolError, ProtocolResult};
use crate::table::FieldTable;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,

    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
}

impl Method {
    /// `(class_id, method_id)` as carried on the wire
    pub fn ids(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (class::CONNECTION, 10),
            ConnectionStartOk { .. } => (class::CONNECTION, 11),
            ConnectionTune { .. } => (class::CONNECTION, 30),
            ConnectionTuneOk { .. } => (class::CONNECTION, 31),
            ConnectionOpen { .. } => (class::CONNECTION, 40),
            ConnectionOpenOk => (class::CONNECTION, 41),
            ConnectionClose { .. } => (class::CONNECTION, 50),
            ConnectionCloseOk => (class::CONNECTION, 51),
            ConnectionBlocked { .. } => (class::CONNECTION, 60),
            ConnectionUnblocked => (class::CONNECTION, 61),
            ChannelOpen => (class::CHANNEL, 10),
            ChannelOpenOk => (class::CHANNEL, 11),
            ChannelFlow { .. } => (class::CHANNEL, 20),
            ChannelFlowOk { .. } => (class::CHANNEL, 21),
            ChannelClose { .. } => (class::CHANNEL, 40),
            ChannelCloseOk => (class::CHANNEL, 41),
            ExchangeDeclare { .. } => (class::EXCHANGE, 10),
            ExchangeDeclareOk => (class::EXCHANGE, 11),
            QueueDeclare { .. } => (class::QUEUE, 10),
            QueueDeclareOk { .. } => (class::QUEUE, 11),
            QueueBind { .. } => (class::QUEUE, 20),
            QueueBindOk => (class::QUEUE, 21),
            BasicQos { .. } => (class::BASIC, 10),
            BasicQosOk => (class::BASIC, 11),
            BasicConsume { .. } => (class::BASIC, 20),
            BasicConsumeOk { .. } => (class::BASIC, 21),
            BasicCancel { .. } => (class::BASIC, 30),
            BasicCancelOk { .. } => (class::BASIC, 31),
            BasicPublish { .. } => (class::BASIC, 40),
            BasicReturn { .. } => (class::BASIC, 50),
            BasicDeliver { .. } => (class::BASIC, 60),
        }
    }

    /// Methods followed by a content header and body frames
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish { .. } | Method::BasicReturn { .. } | Method::BasicDeliver { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        use Method::*;
        match self {
            ConnectionStart { .. } => "connection.start",
            ConnectionStartOk { .. } => "connection.start-ok",
            ConnectionTune { .. } => "connection.tune",
            ConnectionTuneOk { .. } => "connection.tune-ok",
            ConnectionOpen { .. } => "connection.open",
            ConnectionOpenOk => "connection.open-ok",
            ConnectionClose { .. } => "connection.close",
            ConnectionCloseOk => "connection.close-ok",
            ConnectionBlocked { .. } => "connection.blocked",
            ConnectionUnblocked => "connection.unblocked",
            ChannelOpen => "channel.open",
            ChannelOpenOk => "channel.open-ok",
            ChannelFlow { .. } => "channel.flow",
            ChannelFlowOk { .. } => "channel.flow-ok",
            ChannelClose { .. } => "channel.close",
            ChannelCloseOk => "channel.close-ok",
            ExchangeDeclare { .. } => "exchange.declare",
            ExchangeDeclareOk => "exchange.declare-ok",
            QueueDeclare { .. } => "queue.declare",
            QueueDeclareOk { .. } => "queue.declare-ok",
            QueueBind { .. } => "queue.bind",
            QueueBindOk => "queue.bind-ok",
            BasicQos { .. } => "basic.qos",
            BasicQosOk => "basic.qos-ok",
            BasicConsume { .. } => "basic.consume",
            BasicConsumeOk { .. } => "basic.consume-ok",
            BasicCancel { .. } => "basic.cancel",
            BasicCancelOk { .. } => "basic.cancel-ok",
            BasicPublish { .. } => "basic.publish",
            BasicReturn { .. } => "basic.return",
            BasicDeliver { .. } => "basic.deliver",
        }
    }

    /// Encode class id, method id and arguments into a method frame payload
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        use Method::*;
        let (class_id, method_id) = self.ids();
        let mut w = FieldWriter::with_capacity(64);
        w.put_u16(class_id);
        w.put_u16(method_id);

        match self {
            ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                w.put_u8(*version_major);
                w.put_u8(*version_minor);
                w.put_table(server_properties)?;
                w.put_long_bytes(mechanisms.as_bytes());
                w.put_long_bytes(locales.as_bytes());
            }
            ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                w.put_table(client_properties)?;
                w.put_short_str(mechanism, "mechanism")?;
                w.put_long_bytes(response);
                w.put_short_str(locale, "locale")?;
            }
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                w.put_u16(*channel_max);
                w.put_u32(*frame_max);
                w.put_u16(*heartbeat);
            }
            ConnectionOpen { virtual_host } => {
                w.put_short_str(virtual_host, "virtual host")?;
                w.put_short_str("", "capabilities")?;
                w.put_bits(&[false]);
            }
            ConnectionOpenOk => w.put_short_str("", "known hosts")?,
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                w.put_u16(*reply_code);
                w.put_short_str(reply_text, "reply text")?;
                w.put_u16(*class_id);
                w.put_u16(*method_id);
            }
            ConnectionCloseOk | ConnectionUnblocked | ChannelCloseOk => {}
            ConnectionBlocked { reason } => w.put_short_str(reason, "blocked reason")?,
            ChannelOpen => w.put_short_str("", "out of band")?,
            ChannelOpenOk => w.put_long_bytes(&[]),
            ChannelFlow { active } | ChannelFlowOk { active } => w.put_bits(&[*active]),
            ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                w.put_u16(0);
                w.put_short_str(exchange, "exchange")?;
                w.put_short_str(kind, "exchange type")?;
                w.put_bits(&[*passive, *durable, *auto_delete, *internal, *no_wait]);
                w.put_table(arguments)?;
            }
            ExchangeDeclareOk | QueueBindOk | BasicQosOk => {}
            QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                w.put_u16(0);
                w.put_short_str(queue, "queue")?;
                w.put_bits(&[*passive, *durable, *exclusive, *auto_delete, *no_wait]);
                w.put_table(arguments)?;
            }
            QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                w.put_short_str(queue, "queue")?;
                w.put_u32(*message_count);
                w.put_u32(*consumer_count);
            }
            QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                w.put_u16(0);
                w.put_short_str(queue, "queue")?;
                w.put_short_str(exchange, "exchange")?;
                w.put_short_str(routing_key, "routing key")?;
                w.put_bits(&[*no_wait]);
                w.put_table(arguments)?;
            }
            BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                w.put_u32(*prefetch_size);
                w.put_u16(*prefetch_count);
                w.put_bits(&[*global]);
            }
            BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                w.put_u16(0);
                w.put_short_str(queue, "queue")?;
                w.put_short_str(consumer_tag, "consumer tag")?;
                w.put_bits(&[*no_local, *no_ack, *exclusive, *no_wait]);
                w.put_table(arguments)?;
            }
            BasicConsumeOk { consumer_tag } | BasicCancelOk { consumer_tag } => {
                w.put_short_str(consumer_tag, "consumer tag")?;
            }
            BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                w.put_short_str(consumer_tag, "consumer tag")?;
                w.put_bits(&[*no_wait]);
            }
            BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                w.put_u16(0);
                w.put_short_str(exchange, "exchange")?;
                w.put_short_str(routing_key, "routing key")?;
                w.put_bits(&[*mandatory, *immediate]);
            }
            BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                w.put_u16(*reply_code);
                w.put_short_str(reply_text, "reply text")?;
                w.put_short_str(exchange, "exchange")?;
                w.put_short_str(routing_key, "routing key")?;
            }
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                w.put_short_str(consumer_tag, "consumer tag")?;
                w.put_u64(*delivery_tag);
                w.put_bits(&[*redelivered]);
                w.put_short_str(exchange, "exchange")?;
                w.put_short_str(routing_key, "routing key")?;
            }
        }

        Ok(w.into_bytes())
    }

    /// Decode a method frame payload
    pub fn decode(payload: &[u8]) -> ProtocolResult<Method> {
        let mut r = FieldReader::new(payload);
        let class_id = r.read_u16()?;
        let method_id = r.read_u16()?;

        let method = match (class_id, method_id) {
            (class::CONNECTION, 10) => Method::ConnectionStart {
                version_major: r.read_u8()?,
                version_minor: r.read_u8()?,
                server_properties: r.read_table()?,
                mechanisms: r.read_long_str_lossy()?,
                locales: r.read_long_str_lossy()?,
            },
            (class::CONNECTION, 11) => Method::ConnectionStartOk {
                client_properties: r.read_table()?,
                mechanism: r.read_short_str()?,
                response: r.read_long_bytes()?,
                locale: r.read_short_str()?,
            },
            (class::CONNECTION, 30) => Method::ConnectionTune {
                channel_max: r.read_u16()?,
                frame_max: r.read_u32()?,
                heartbeat: r.read_u16()?,
            },
            (class::CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: r.read_u16()?,
                frame_max: r.read_u32()?,
                heartbeat: r.read_u16()?,
            },
            (class::CONNECTION, 40) => {
                let virtual_host = r.read_short_str()?;
                r.read_short_str()?;
                r.read_bits::<1>()?;
                Method::ConnectionOpen { virtual_host }
            }
            (class::CONNECTION, 41) => {
                r.read_short_str()?;
                Method::ConnectionOpenOk
            }
            (class::CONNECTION, 50) => Method::ConnectionClose {
                reply_code: r.read_u16()?,
                reply_text: r.read_short_str()?,
                class_id: r.read_u16()?,
                method_id: r.read_u16()?,
            },
            (class::CONNECTION, 51) => Method::ConnectionCloseOk,
            (class::CONNECTION, 60) => Method::ConnectionBlocked {
                reason: r.read_short_str()?,
            },
            (class::CONNECTION, 61) => Method::ConnectionUnblocked,

            (class::CHANNEL, 10) => {
                r.read_short_str()?;
                Method::ChannelOpen
            }
            (class::CHANNEL, 11) => {
                r.read_long_bytes()?;
                Method::ChannelOpenOk
            }
            (class::CHANNEL, 20) => Method::ChannelFlow {
                active: r.read_bits::<1>()?[0],
            },
            (class::CHANNEL, 21) => Method::ChannelFlowOk {
                active: r.read_bits::<1>()?[0],
            },
            (class::CHANNEL, 40) => Method::ChannelClose {
                reply_code: r.read_u16()?,
                reply_text: r.read_short_str()?,
                class_id: r.read_u16()?,
                method_id: r.read_u16()?,
            },
            (class::CHANNEL, 41) => Method::ChannelCloseOk,

            (class::EXCHANGE, 10) => {
                r.read_u16()?;
                let exchange = r.read_short_str()?;
                let kind = r.read_short_str()?;
                let [passive, durable, auto_delete, internal, no_wait] = r.read_bits::<5>()?;
                Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive,
                    durable,
                    auto_delete,
                    internal,
                    no_wait,
                    arguments: r.read_table()?,
                }
            }
            (class::EXCHANGE, 11) => Method::ExchangeDeclareOk,

            (class::QUEUE, 10) => {
                r.read_u16()?;
                let queue = r.read_short_str()?;
                let [passive, durable, exclusive, auto_delete, no_wait] = r.read_bits::<5>()?;
                Method::QueueDeclare {
                    queue,
                    passive,
                    durable,
                    exclusive,
                    auto_delete,
                    no_wait,
                    arguments: r.read_table()?,
                }
            }
            (class::QUEUE, 11) => Method::QueueDeclareOk {
                queue: r.read_short_str()?,
                message_count: r.read_u32()?,
                consumer_count: r.read_u32()?,
            },
            (class::QUEUE, 20) => {
                r.read_u16()?;
                let queue = r.read_short_str()?;
                let exchange = r.read_short_str()?;
                let routing_key = r.read_short_str()?;
                let [no_wait] = r.read_bits::<1>()?;
                Method::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait,
                    arguments: r.read_table()?,
                }
            }
            (class::QUEUE, 21) => Method::QueueBindOk,

            (class::BASIC, 10) => Method::BasicQos {
                prefetch_size: r.read_u32()?,
                prefetch_count: r.read_u16()?,
                global: r.read_bits::<1>()?[0],
            },
            (class::BASIC, 11) => Method::BasicQosOk,
            (class::BASIC, 20) => {
                r.read_u16()?;
                let queue = r.read_short_str()?;
                let consumer_tag = r.read_short_str()?;
                let [no_local, no_ack, exclusive, no_wait] = r.read_bits::<4>()?;
                Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local,
                    no_ack,
                    exclusive,
                    no_wait,
                    arguments: r.read_table()?,
                }
            }
            (class::BASIC, 21) => Method::BasicConsumeOk {
                consumer_tag: r.read_short_str()?,
            },
            (class::BASIC, 30) => Method::BasicCancel {
                consumer_tag: r.read_short_str()?,
                no_wait: r.read_bits::<1>()?[0],
            },
            (class::BASIC, 31) => Method::BasicCancelOk {
                consumer_tag: r.read_short_str()?,
            },
            (class::BASIC, 40) => {
                r.read_u16()?;
                let exchange = r.read_short_str()?;
                let routing_key = r.read_short_str()?;
                let [mandatory, immediate] = r.read_bits::<2>()?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory,
                    immediate,
                }
            }
            (class::BASIC, 50) => Method::BasicReturn {
                reply_code: r.read_u16()?,
                reply_text: r.read_short_str()?,
                exchange: r.read_short_str()?,
                routing_key: r.read_short_str()?,
            },
            (class::BASIC, 60) => {
                let consumer_tag = r.read_short_str()?;
                let delivery_tag = r.read_u64()?;
                let [redelivered] = r.read_bits::<1>()?;
                Method::BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange: r.read_short_str()?,
                    routing_key: r.read_short_str()?,
                }
            }
            _ => return Err(ProtocolError::unknown_method(class_id, method_id)),
        };

        Ok(method)
    }
}
