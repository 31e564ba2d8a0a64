//! # AMQP 0-9-1 Adapter
//!
//! A from-scratch AMQP client on top of `mq-codec`:
//!
//! - `connection`: handshake, receive/writer/heartbeat tasks, RPC
//!   correlation, publish, subscribe and teardown
//! - `dispatch`: channel and consumer tables, inbound frame routing and
//!   delivery reassembly
//! - `subject`: `exchange/routingKey` addressing and message conversion
//!
//! Channel 1 carries publishes; each subscription owns a channel from 2 up.

mod connection;
mod dispatch;
mod subject;

pub use connection::{AmqpConnection, AmqpParams, Tuning};
pub use subject::AmqpTarget;

use crate::common::{BasicClient, StateNotifier, Subscription};
use async_trait::async_trait;
use mq_config::{
    amqp_vhost, broker_addresses, AmqpSettings, ProviderKind, SessionSettings, TimeoutSettings,
};
use mq_network::TcpTransportConfig;
use mq_types::{BrokerError, BrokerResult, ConnectionConfig, ConnectionState, UnifiedMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

const DEFAULT_CREDENTIAL: &str = "guest";

#[derive(Debug)]
pub struct AmqpClient {
    settings: AmqpSettings,
    timeouts: TimeoutSettings,
    state: Arc<StateNotifier>,
    connection: Mutex<Option<Arc<AmqpConnection>>>,
}

impl AmqpClient {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            settings: settings.amqp.clone(),
            timeouts: settings.timeouts.clone(),
            state: Arc::new(StateNotifier::new()),
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> BrokerResult<Arc<AmqpConnection>> {
        self.connection
            .lock()
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn params(&self, config: &ConnectionConfig) -> BrokerResult<AmqpParams> {
        Ok(AmqpParams {
            vhost: amqp_vhost(&config.url)?,
            username: config
                .username
                .clone()
                .unwrap_or_else(|| DEFAULT_CREDENTIAL.to_string()),
            password: config
                .password
                .clone()
                .unwrap_or_else(|| DEFAULT_CREDENTIAL.to_string()),
            heartbeat: self.settings.heartbeat_secs,
            prefetch: self.settings.prefetch,
            client_name: if config.name.is_empty() {
                self.settings.client_name.clone()
            } else {
                config.name.clone()
            },
            timeouts: self.timeouts.clone(),
        })
    }

    async fn open(&self, config: &ConnectionConfig) -> BrokerResult<Arc<AmqpConnection>> {
        let params = self.params(config)?;
        let address = broker_addresses(&config.url, ProviderKind::Amqp.default_port(config.tls))?
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::invalid_configuration("AMQP URL has no host"))?;

        info!(address = %address, vhost = %params.vhost, tls = config.tls, "Connecting to AMQP broker");
        let transport = TcpTransportConfig {
            connect_timeout: self.timeouts.connect(),
            nodelay: true,
        };
        let stream = mq_network::connect(&address.host, address.port, config.tls, &transport).await?;
        AmqpConnection::open(stream, params, self.state.clone()).await
    }

    /// Declare an exchange on the publish channel
    pub async fn declare_exchange(&self, name: &str, kind: &str, durable: bool) -> BrokerResult<()> {
        self.connection()?.declare_exchange(name, kind, durable).await
    }

    /// Limits agreed with the broker, once connected
    pub fn tuning(&self) -> Option<Tuning> {
        self.connection.lock().as_ref().map(|c| c.tuning())
    }
}

#[async_trait]
impl BasicClient for AmqpClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Amqp
    }

    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()> {
        self.state.begin_connect()?;
        match self.open(config).await {
            Ok(connection) => {
                *self.connection.lock() = Some(connection);
                self.state.set(ConnectionState::Connected);
                info!(url = %config.url, "AMQP connected");
                Ok(())
            }
            Err(e) => {
                error!(url = %config.url, error = %e, "AMQP connect failed");
                self.state.set(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close(self.timeouts.disconnect()).await;
            info!("AMQP disconnected");
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()> {
        self.connection()?.publish(&message, subject).await
    }

    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        self.connection()?.subscribe(pattern).await
    }

    async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        self.connection()?.unsubscribe(pattern).await
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
