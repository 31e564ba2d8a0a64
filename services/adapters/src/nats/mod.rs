//! # NATS Adapter
//!
//! Plain NATS publish/subscribe and request/reply over the hand-written
//! client protocol in `protocol`. [`NatsCore`] holds the connection and the
//! operations both the `nats` and the `jetstream` providers expose.

mod connection;
pub mod protocol;

pub use connection::{new_inbox, Deliver, NatsConnection, NatsParams};
pub use protocol::{InboundMessage, NatsHeaders, ServerInfo};

use crate::common::{BasicClient, CancelHandle, StateNotifier, Subscription};
use async_trait::async_trait;
use mq_config::{broker_addresses, NatsSettings, ProviderKind, SessionSettings, TimeoutSettings};
use mq_network::TcpTransportConfig;
use mq_types::{BrokerError, BrokerResult, ConnectionConfig, ConnectionState, UnifiedMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Status a NATS server answers with when nobody listens on a request subject
pub const STATUS_NO_RESPONDERS: u16 = 503;
/// Header carrying the inline status of a received message
pub const STATUS_HEADER: &str = "nats.status";

/// Convert a delivered message into the unified shape
pub fn unified_message(message: InboundMessage) -> UnifiedMessage {
    let mut unified = UnifiedMessage::new(message.subject, message.payload);
    if let Some(headers) = message.headers {
        let mut values = headers.values;
        if let Some(status) = headers.status {
            values.insert(STATUS_HEADER.to_string(), status.to_string());
        }
        unified = unified.with_headers(values);
    }
    if let Some(reply_to) = message.reply_to {
        unified = unified.with_reply_to(reply_to);
    }
    unified
}

struct NatsCancel {
    connection: Weak<NatsConnection>,
    sid: u64,
    done: AtomicBool,
}

impl CancelHandle for NatsCancel {
    fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.unsubscribe_sid(self.sid);
        }
    }
}

/// Connection holder shared by the NATS-based providers
#[derive(Debug)]
pub struct NatsCore {
    provider: ProviderKind,
    settings: NatsSettings,
    timeouts: TimeoutSettings,
    state: Arc<StateNotifier>,
    connection: Mutex<Option<Arc<NatsConnection>>>,
}

impl NatsCore {
    pub fn new(provider: ProviderKind, settings: &SessionSettings) -> Self {
        Self {
            provider,
            settings: settings.nats.clone(),
            timeouts: settings.timeouts.clone(),
            state: Arc::new(StateNotifier::new()),
            connection: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn settings(&self) -> &NatsSettings {
        &self.settings
    }

    pub fn timeouts(&self) -> &TimeoutSettings {
        &self.timeouts
    }

    pub fn connection(&self) -> BrokerResult<Arc<NatsConnection>> {
        self.connection
            .lock()
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn params(&self, config: &ConnectionConfig) -> NatsParams {
        // nats://token@host carries a bare token in the user slot
        let (user, pass, token) = match (&config.username, &config.password, &config.token) {
            (Some(user), None, None) => (None, None, Some(user.clone())),
            (user, pass, token) => (user.clone(), pass.clone(), token.clone()),
        };
        NatsParams {
            name: if config.name.is_empty() {
                self.settings.client_name.clone()
            } else {
                config.name.clone()
            },
            user,
            pass,
            token,
            tls: config.tls,
            ping_interval: self.settings.ping_interval(),
            max_pings_outstanding: self.settings.max_pings_outstanding,
            timeouts: self.timeouts.clone(),
        }
    }

    async fn open(&self, config: &ConnectionConfig) -> BrokerResult<Arc<NatsConnection>> {
        let address = broker_addresses(&config.url, self.provider.default_port(config.tls))?
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::invalid_configuration("NATS URL has no host"))?;
        info!(address = %address, tls = config.tls, provider = %self.provider, "Connecting to NATS server");

        let transport = TcpTransportConfig {
            connect_timeout: self.timeouts.connect(),
            nodelay: true,
        };
        // TLS is negotiated after INFO, never at TCP connect
        let stream = mq_network::connect(&address.host, address.port, false, &transport).await?;
        NatsConnection::open(stream, &address.host, &self.params(config), self.state.clone()).await
    }

    pub async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()> {
        self.state.begin_connect()?;
        match self.open(config).await {
            Ok(connection) => {
                *self.connection.lock() = Some(connection);
                self.state.set(ConnectionState::Connected);
                info!(url = %config.url, provider = %self.provider, "NATS connected");
                Ok(())
            }
            Err(e) => {
                error!(url = %config.url, error = %e, "NATS connect failed");
                self.state.set(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> BrokerResult<()> {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close(self.timeouts.disconnect()).await;
            info!(provider = %self.provider, "NATS disconnected");
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    pub fn publish(&self, message: &UnifiedMessage, subject: &str) -> BrokerResult<()> {
        self.connection()?.publish(
            subject,
            message.reply_to(),
            message.headers(),
            message.payload(),
        )?;
        debug!(subject = %subject, bytes = message.size(), "Published");
        Ok(())
    }

    pub fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        let connection = self.connection()?;
        let (tx, rx) = Subscription::channel();
        let deliver: Deliver = Box::new(move |item| {
            tx.send(item.map(unified_message)).is_ok()
        });
        let sid = connection.subscribe(pattern, deliver)?;
        info!(pattern = %pattern, sid, "NATS subscription started");

        let cancel = Arc::new(NatsCancel {
            connection: Arc::downgrade(&connection),
            sid,
            done: AtomicBool::new(false),
        });
        Ok(Subscription::new(pattern, rx, cancel))
    }

    pub fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        let removed = self.connection()?.unsubscribe_subject(pattern);
        debug!(pattern = %pattern, removed, "NATS unsubscribe");
        Ok(())
    }

    /// Request/reply; `None` when the server reports no responders
    pub async fn request(
        &self,
        message: &UnifiedMessage,
        subject: &str,
        wait: Duration,
    ) -> BrokerResult<Option<UnifiedMessage>> {
        let reply = self
            .connection()?
            .request(subject, message.headers(), message.payload(), wait)
            .await?;
        if reply.status() == Some(STATUS_NO_RESPONDERS) {
            debug!(subject = %subject, "No responders");
            return Ok(None);
        }
        Ok(Some(unified_message(reply)))
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Plain NATS provider
#[derive(Debug)]
pub struct NatsClient {
    core: NatsCore,
}

impl NatsClient {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            core: NatsCore::new(ProviderKind::Nats, settings),
        }
    }
}

#[async_trait]
impl BasicClient for NatsClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Nats
    }

    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()> {
        self.core.connect(config).await
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.core.disconnect().await
    }

    async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()> {
        self.core.publish(&message, subject)
    }

    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        self.core.subscribe(pattern)
    }

    async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        self.core.unsubscribe(pattern)
    }

    async fn request(
        &self,
        message: UnifiedMessage,
        subject: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<UnifiedMessage>> {
        self.core.request(&message, subject, timeout).await
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.core.state_changes()
    }
}
