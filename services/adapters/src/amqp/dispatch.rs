//! Connection tables and inbound frame dispatch
//!
//! Everything the receive loop needs to route a frame lives in [`Tables`]:
//! open channels, the single pending RPC per channel, consumers by tag and
//! half-assembled content. Dispatch is synchronous and performs no I/O;
//! frames the client must answer with are collected for the writer.

use super::subject::{delivery_message, DeliveryInfo};
use crate::common::SubscriptionSender;
use bytes::{Bytes, BytesMut};
use mq_codec::{ContentHeader, Frame, Method, ProtocolError, ProtocolResult};
use mq_types::{BrokerError, UnifiedMessage};
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Fixed channel for publishing
pub const PUBLISH_CHANNEL: u16 = 1;
/// First channel handed to subscriptions
pub const FIRST_SUBSCRIPTION_CHANNEL: u16 = 2;

/// Why an RPC did not produce a reply method
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The broker closed the channel instead of replying
    ChannelClosed { reply_code: u16, reply_text: String },
    Broker(BrokerError),
}

impl From<RpcError> for BrokerError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::ChannelClosed {
                reply_code,
                reply_text,
            } => BrokerError::provider(format!(
                "channel closed by broker: {} {}",
                reply_code, reply_text
            )),
            RpcError::Broker(e) => e,
        }
    }
}

impl From<BrokerError> for RpcError {
    fn from(err: BrokerError) -> Self {
        RpcError::Broker(err)
    }
}

pub type RpcReply = oneshot::Sender<Result<Method, RpcError>>;

pub struct ConsumerSlot {
    pub channel: u16,
    pub pattern: String,
    pub sender: SubscriptionSender<UnifiedMessage>,
}

enum ContentKind {
    Deliver(DeliveryInfo),
    Return {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
}

struct PendingContent {
    kind: ContentKind,
    header: Option<ContentHeader>,
    body: BytesMut,
}

/// What the receive loop does after a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Broker sent Connection.Close
    ServerClosed { reply_code: u16, reply_text: String },
    /// Broker confirmed our Connection.Close
    CloseAcknowledged,
}

#[derive(Default)]
pub struct Tables {
    open_channels: HashSet<u16>,
    next_channel: u16,
    rpc: HashMap<u16, RpcReply>,
    consumers: HashMap<String, ConsumerSlot>,
    content: HashMap<u16, PendingContent>,
    publish_channel_open: bool,
    closed: Option<String>,
    close_ok: Option<oneshot::Sender<()>>,
}

impl Tables {
    pub fn new() -> Self {
        Self {
            next_channel: FIRST_SUBSCRIPTION_CHANNEL,
            ..Self::default()
        }
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Reserve the next free subscription channel, wrapping at `channel_max`
    pub fn allocate_channel(&mut self, channel_max: u16) -> Result<u16, BrokerError> {
        let span = channel_max.saturating_sub(PUBLISH_CHANNEL) as usize;
        for _ in 0..span {
            let candidate = self.next_channel;
            self.next_channel = if candidate >= channel_max {
                FIRST_SUBSCRIPTION_CHANNEL
            } else {
                candidate + 1
            };
            if self.open_channels.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(BrokerError::provider(format!(
            "no free AMQP channel (channel-max {})",
            channel_max
        )))
    }

    pub fn release_channel(&mut self, channel: u16) {
        self.open_channels.remove(&channel);
        self.content.remove(&channel);
        if channel == PUBLISH_CHANNEL {
            self.publish_channel_open = false;
        }
    }

    pub fn is_open(&self, channel: u16) -> bool {
        self.open_channels.contains(&channel)
    }

    pub fn open_channels(&self) -> Vec<u16> {
        let mut channels: Vec<u16> = self.open_channels.iter().copied().collect();
        channels.sort_unstable();
        channels
    }

    pub fn publish_channel_open(&self) -> bool {
        self.publish_channel_open
    }

    pub fn mark_publish_channel_open(&mut self) {
        self.open_channels.insert(PUBLISH_CHANNEL);
        self.publish_channel_open = true;
    }

    // ------------------------------------------------------------------
    // RPC slots
    // ------------------------------------------------------------------

    pub fn begin_rpc(&mut self, channel: u16, reply: RpcReply) -> Result<(), BrokerError> {
        if let Some(reason) = &self.closed {
            return Err(BrokerError::connection_failed(reason.clone()));
        }
        if self.rpc.contains_key(&channel) {
            return Err(BrokerError::provider(format!(
                "an RPC is already pending on channel {}",
                channel
            )));
        }
        self.rpc.insert(channel, reply);
        Ok(())
    }

    pub fn abandon_rpc(&mut self, channel: u16) {
        self.rpc.remove(&channel);
    }

    fn complete_rpc(&mut self, channel: u16, method: Method) {
        match self.rpc.remove(&channel) {
            Some(reply) => {
                let _ = reply.send(Ok(method));
            }
            None => debug!(channel, method = method.name(), "Ignoring unsolicited method"),
        }
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    pub fn add_consumer(&mut self, tag: String, slot: ConsumerSlot) {
        self.consumers.insert(tag, slot);
    }

    pub fn remove_consumer(&mut self, tag: &str) -> Option<ConsumerSlot> {
        self.consumers.remove(tag)
    }

    /// Detach every consumer subscribed under `pattern`
    pub fn take_consumers_for(&mut self, pattern: &str) -> Vec<(String, ConsumerSlot)> {
        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, slot)| slot.pattern == pattern)
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.into_iter()
            .filter_map(|tag| self.consumers.remove(&tag).map(|slot| (tag, slot)))
            .collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn closed_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub fn expect_close_ok(&mut self, tx: oneshot::Sender<()>) {
        self.close_ok = Some(tx);
    }

    /// Mark the connection dead and end every waiter and consumer
    pub fn fail_all(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for (_, reply) in self.rpc.drain() {
            let _ = reply.send(Err(RpcError::Broker(BrokerError::connection_failed(
                reason.to_string(),
            ))));
        }
        for (_, slot) in self.consumers.drain() {
            let _ = slot
                .sender
                .send(Err(BrokerError::connection_failed(reason.to_string())));
        }
        self.content.clear();
        self.open_channels.clear();
        self.publish_channel_open = false;
        if let Some(tx) = self.close_ok.take() {
            let _ = tx.send(());
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Route one inbound frame; answers go to `replies`
    pub fn handle_frame(&mut self, frame: Frame, replies: &mut Vec<Frame>) -> ProtocolResult<Flow> {
        match frame {
            Frame::Heartbeat => Ok(Flow::Continue),
            Frame::Method { channel: 0, method } => Ok(self.on_connection_method(method, replies)),
            Frame::Method { channel, method } => {
                self.on_channel_method(channel, method, replies)?;
                Ok(Flow::Continue)
            }
            Frame::Header { channel, header } => {
                self.on_header(channel, header)?;
                Ok(Flow::Continue)
            }
            Frame::Body { channel, payload } => {
                self.on_body(channel, payload)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn on_connection_method(&mut self, method: Method, replies: &mut Vec<Frame>) -> Flow {
        match method {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            } => {
                replies.push(Frame::method(0, Method::ConnectionCloseOk));
                Flow::ServerClosed {
                    reply_code,
                    reply_text,
                }
            }
            Method::ConnectionCloseOk => {
                if let Some(tx) = self.close_ok.take() {
                    let _ = tx.send(());
                }
                Flow::CloseAcknowledged
            }
            Method::ConnectionBlocked { reason } => {
                warn!(reason = %reason, "Broker blocked publishing on this connection");
                Flow::Continue
            }
            Method::ConnectionUnblocked => {
                info!("Broker unblocked publishing");
                Flow::Continue
            }
            other => {
                self.complete_rpc(0, other);
                Flow::Continue
            }
        }
    }

    fn on_channel_method(
        &mut self,
        channel: u16,
        method: Method,
        replies: &mut Vec<Frame>,
    ) -> ProtocolResult<()> {
        match method {
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => self.start_content(
                channel,
                ContentKind::Deliver(DeliveryInfo {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                }),
            ),
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => self.start_content(
                channel,
                ContentKind::Return {
                    reply_code,
                    reply_text,
                    exchange,
                    routing_key,
                },
            ),
            Method::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => {
                replies.push(Frame::method(channel, Method::ChannelCloseOk));
                self.on_server_channel_close(channel, reply_code, reply_text);
                Ok(())
            }
            Method::ChannelFlow { active } => {
                info!(channel, active, "Broker changed channel flow");
                replies.push(Frame::method(channel, Method::ChannelFlowOk { active }));
                Ok(())
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                warn!(channel, consumer_tag = %consumer_tag, "Consumer cancelled by broker");
                if let Some(slot) = self.consumers.remove(&consumer_tag) {
                    let _ = slot
                        .sender
                        .send(Err(BrokerError::subscription_failed("consumer cancelled by broker")));
                }
                if !no_wait {
                    replies.push(Frame::method(channel, Method::BasicCancelOk { consumer_tag }));
                }
                Ok(())
            }
            other => {
                self.complete_rpc(channel, other);
                Ok(())
            }
        }
    }

    fn on_server_channel_close(&mut self, channel: u16, reply_code: u16, reply_text: String) {
        warn!(channel, reply_code, reply_text = %reply_text, "Channel closed by broker");
        self.release_channel(channel);

        if let Some(reply) = self.rpc.remove(&channel) {
            let _ = reply.send(Err(RpcError::ChannelClosed {
                reply_code,
                reply_text: reply_text.clone(),
            }));
        }

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, slot)| slot.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            if let Some(slot) = self.consumers.remove(&tag) {
                let _ = slot.sender.send(Err(BrokerError::subscription_failed(format!(
                    "channel closed by broker: {} {}",
                    reply_code, reply_text
                ))));
            }
        }
    }

    fn start_content(&mut self, channel: u16, kind: ContentKind) -> ProtocolResult<()> {
        if self.content.contains_key(&channel) {
            return Err(ProtocolError::unexpected_frame(format!(
                "new content method on channel {} before the previous content completed",
                channel
            )));
        }
        self.content.insert(
            channel,
            PendingContent {
                kind,
                header: None,
                body: BytesMut::new(),
            },
        );
        Ok(())
    }

    fn on_header(&mut self, channel: u16, header: ContentHeader) -> ProtocolResult<()> {
        let pending = self.content.get_mut(&channel).ok_or_else(|| {
            ProtocolError::unexpected_frame(format!(
                "content header on channel {} without a pending delivery",
                channel
            ))
        })?;
        if pending.header.is_some() {
            return Err(ProtocolError::unexpected_frame(format!(
                "second content header on channel {}",
                channel
            )));
        }
        let body_size = header.body_size;
        pending.body.reserve(body_size.min(1 << 20) as usize);
        pending.header = Some(header);
        if body_size == 0 {
            self.finish_content(channel);
        }
        Ok(())
    }

    fn on_body(&mut self, channel: u16, payload: Bytes) -> ProtocolResult<()> {
        let pending = self.content.get_mut(&channel).ok_or_else(|| {
            ProtocolError::unexpected_frame(format!(
                "content body on channel {} without a pending delivery",
                channel
            ))
        })?;
        let body_size = match &pending.header {
            Some(header) => header.body_size,
            None => {
                return Err(ProtocolError::unexpected_frame(format!(
                    "content body on channel {} before its header",
                    channel
                )))
            }
        };
        pending.body.extend_from_slice(&payload);
        let received = pending.body.len() as u64;
        if received > body_size {
            return Err(ProtocolError::unexpected_frame(format!(
                "content body on channel {} exceeds declared size {} ({} bytes)",
                channel, body_size, received
            )));
        }
        if received == body_size {
            self.finish_content(channel);
        }
        Ok(())
    }

    fn finish_content(&mut self, channel: u16) {
        let Some(pending) = self.content.remove(&channel) else {
            return;
        };
        let Some(header) = pending.header else {
            return;
        };
        let body = pending.body.freeze();

        match pending.kind {
            ContentKind::Deliver(info) => {
                let message = delivery_message(&info, &header.properties, body);
                match self.consumers.get(&info.consumer_tag) {
                    Some(slot) => {
                        debug!(
                            channel,
                            consumer_tag = %info.consumer_tag,
                            subject = %message.subject(),
                            bytes = message.size(),
                            "Delivery"
                        );
                        if slot.sender.send(Ok(message)).is_err() {
                            debug!(consumer_tag = %info.consumer_tag, "Subscriber gone, dropping delivery");
                        }
                    }
                    None => debug!(
                        channel,
                        consumer_tag = %info.consumer_tag,
                        "Delivery for unknown consumer tag dropped"
                    ),
                }
            }
            ContentKind::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => warn!(
                channel,
                reply_code,
                reply_text = %reply_text,
                exchange = %exchange,
                routing_key = %routing_key,
                bytes = body.len(),
                "Message returned by broker"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Subscription;
    use mq_codec::BasicProperties;

    fn deliver(channel: u16, tag: &str, routing_key: &str) -> Frame {
        Frame::method(
            channel,
            Method::BasicDeliver {
                consumer_tag: tag.into(),
                delivery_tag: 1,
                redelivered: false,
                exchange: String::new(),
                routing_key: routing_key.into(),
            },
        )
    }

    fn header(channel: u16, body_size: u64) -> Frame {
        Frame::Header {
            channel,
            header: ContentHeader {
                class_id: 60,
                body_size,
                properties: BasicProperties::default(),
            },
        }
    }

    fn body(channel: u16, data: &'static [u8]) -> Frame {
        Frame::Body {
            channel,
            payload: Bytes::from_static(data),
        }
    }

    fn with_consumer(tables: &mut Tables, channel: u16, tag: &str) -> tokio::sync::mpsc::UnboundedReceiver<mq_types::BrokerResult<UnifiedMessage>> {
        let (tx, rx) = Subscription::<UnifiedMessage>::channel();
        tables.add_consumer(
            tag.to_string(),
            ConsumerSlot {
                channel,
                pattern: "orders.created".into(),
                sender: tx,
            },
        );
        rx
    }

    #[test]
    fn test_channel_allocation_wraps_and_skips_open() {
        let mut tables = Tables::new();
        assert_eq!(tables.allocate_channel(4).unwrap(), 2);
        assert_eq!(tables.allocate_channel(4).unwrap(), 3);
        assert_eq!(tables.allocate_channel(4).unwrap(), 4);
        assert!(tables.allocate_channel(4).is_err());

        tables.release_channel(3);
        assert_eq!(tables.allocate_channel(4).unwrap(), 3);
        assert!(tables.allocate_channel(1).is_err());
    }

    #[test]
    fn test_one_rpc_per_channel() {
        let mut tables = Tables::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        tables.begin_rpc(2, tx1).unwrap();
        assert!(tables.begin_rpc(2, tx2).is_err());

        let mut replies = Vec::new();
        tables
            .handle_frame(Frame::method(2, Method::ChannelOpenOk), &mut replies)
            .unwrap();
        assert_eq!(rx1.try_recv().unwrap(), Ok(Method::ChannelOpenOk));
        assert!(replies.is_empty());
    }

    #[test]
    fn test_delivery_reassembly_across_bodies() {
        let mut tables = Tables::new();
        let mut rx = with_consumer(&mut tables, 2, "mq-1");
        let mut replies = Vec::new();

        for frame in [
            deliver(2, "mq-1", "orders.created"),
            header(2, 8),
            body(2, b"{\"id\""),
            body(2, b":1}"),
        ] {
            assert_eq!(tables.handle_frame(frame, &mut replies).unwrap(), Flow::Continue);
        }

        let msg = rx.try_recv().unwrap().unwrap();
        assert_eq!(msg.subject(), "orders.created");
        assert_eq!(msg.payload().as_ref(), b"{\"id\":1}");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_body_completes_on_header() {
        let mut tables = Tables::new();
        let mut rx = with_consumer(&mut tables, 2, "mq-1");
        let mut replies = Vec::new();
        tables.handle_frame(deliver(2, "mq-1", "k"), &mut replies).unwrap();
        tables.handle_frame(header(2, 0), &mut replies).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap().size(), 0);
    }

    #[test]
    fn test_body_without_delivery_is_protocol_error() {
        let mut tables = Tables::new();
        let mut replies = Vec::new();
        assert!(tables.handle_frame(body(2, b"x"), &mut replies).is_err());
        tables.handle_frame(deliver(2, "t", "k"), &mut replies).unwrap();
        tables.handle_frame(header(2, 1), &mut replies).unwrap();
        assert!(tables.handle_frame(body(2, b"xx"), &mut replies).is_err());
    }

    #[test]
    fn test_server_channel_close_ends_only_that_subscription() {
        let mut tables = Tables::new();
        tables.allocate_channel(10).unwrap();
        tables.allocate_channel(10).unwrap();
        let mut rx2 = with_consumer(&mut tables, 2, "mq-2");
        let mut rx3 = with_consumer(&mut tables, 3, "mq-3");
        let (tx, mut rpc_rx) = oneshot::channel();
        tables.begin_rpc(2, tx).unwrap();

        let mut replies = Vec::new();
        tables
            .handle_frame(
                Frame::method(
                    2,
                    Method::ChannelClose {
                        reply_code: 406,
                        reply_text: "PRECONDITION_FAILED".into(),
                        class_id: 50,
                        method_id: 10,
                    },
                ),
                &mut replies,
            )
            .unwrap();

        assert_eq!(replies, vec![Frame::method(2, Method::ChannelCloseOk)]);
        assert!(matches!(
            rpc_rx.try_recv().unwrap(),
            Err(RpcError::ChannelClosed { reply_code: 406, .. })
        ));
        assert!(matches!(rx2.try_recv().unwrap(), Err(BrokerError::SubscriptionFailed(_))));
        assert!(rx3.try_recv().is_err());
        assert_eq!(tables.consumer_count(), 1);
        assert_eq!(tables.open_channels(), vec![3]);
    }

    #[test]
    fn test_connection_close_and_flow_are_answered() {
        let mut tables = Tables::new();
        let mut replies = Vec::new();

        let flow = tables
            .handle_frame(Frame::method(2, Method::ChannelFlow { active: false }), &mut replies)
            .unwrap();
        assert_eq!(flow, Flow::Continue);

        let flow = tables
            .handle_frame(
                Frame::method(
                    0,
                    Method::ConnectionClose {
                        reply_code: 320,
                        reply_text: "CONNECTION_FORCED".into(),
                        class_id: 0,
                        method_id: 0,
                    },
                ),
                &mut replies,
            )
            .unwrap();
        assert_eq!(
            flow,
            Flow::ServerClosed {
                reply_code: 320,
                reply_text: "CONNECTION_FORCED".into()
            }
        );
        assert_eq!(
            replies,
            vec![
                Frame::method(2, Method::ChannelFlowOk { active: false }),
                Frame::method(0, Method::ConnectionCloseOk),
            ]
        );
    }

    #[test]
    fn test_fail_all_ends_everything() {
        let mut tables = Tables::new();
        let mut rx = with_consumer(&mut tables, 2, "mq-1");
        let (tx, mut rpc_rx) = oneshot::channel();
        tables.begin_rpc(3, tx).unwrap();

        tables.fail_all("socket closed");
        assert!(tables.is_closed());
        assert!(matches!(rx.try_recv().unwrap(), Err(BrokerError::ConnectionFailed(_))));
        assert!(rpc_rx.try_recv().unwrap().is_err());

        let (tx, _rx) = oneshot::channel();
        assert!(tables.begin_rpc(4, tx).is_err());
    }
}
