//! # Redis Adapter
//!
//! Pub/sub over RESP2. Publishing goes through a request/response command
//! connection opened at connect time; the subscriber connection is opened on
//! the first subscribe and carries every `PSUBSCRIBE`.

mod connection;
pub mod resp;

pub use connection::{CommandLink, PubSubLink, RedisEndpoint, PATTERN_HEADER};

use crate::common::{BasicClient, CancelHandle, StateNotifier, Subscription};
use async_trait::async_trait;
use mq_config::{broker_addresses, url_path, ProviderKind, SessionSettings, TimeoutSettings};
use mq_types::{BrokerError, BrokerResult, ConnectionConfig, ConnectionState, UnifiedMessage};
use parking_lot::Mutex;
use resp::RespValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Translate a NATS-style pattern into a Redis glob
///
/// Only the `>` tail wildcard changes; a Redis `*` already spans dots.
pub fn redis_pattern(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|token| if token == ">" { "*" } else { token })
        .collect::<Vec<_>>()
        .join(".")
}

/// Endpoint from the sanitized connection config
pub fn endpoint(config: &ConnectionConfig) -> BrokerResult<RedisEndpoint> {
    let address = broker_addresses(&config.url, ProviderKind::Redis.default_port(config.tls))?
        .into_iter()
        .next()
        .ok_or_else(|| BrokerError::invalid_configuration("Redis URL has no host"))?;

    let database = match url_path(&config.url)? {
        Some(path) => Some(path.parse::<u32>().map_err(|_| {
            BrokerError::invalid_configuration(format!("Redis database '{}' is not a number", path))
        })?),
        None => None,
    };

    // redis://secret@host carries a bare password in the user slot
    let (username, password) = match (&config.username, &config.password, &config.token) {
        (Some(user), None, None) => (None, Some(user.clone())),
        (user, Some(pass), _) => (user.clone(), Some(pass.clone())),
        (user, None, token) => (user.clone(), token.clone()),
    };

    Ok(RedisEndpoint {
        host: address.host,
        port: address.port,
        tls: config.tls,
        username,
        password,
        database,
        client_name: Some(config.name.clone()).filter(|n| !n.is_empty()),
    })
}

struct RedisCancel {
    link: Weak<PubSubLink>,
    pattern: String,
    id: u64,
    done: AtomicBool,
}

impl CancelHandle for RedisCancel {
    fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.upgrade() {
            link.release(&self.pattern, self.id);
        }
    }
}

#[derive(Debug)]
pub struct RedisClient {
    timeouts: TimeoutSettings,
    state: Arc<StateNotifier>,
    endpoint: Mutex<Option<RedisEndpoint>>,
    commands: Mutex<Option<Arc<CommandLink>>>,
    subscriber: tokio::sync::Mutex<Option<Arc<PubSubLink>>>,
}

impl RedisClient {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            timeouts: settings.timeouts.clone(),
            state: Arc::new(StateNotifier::new()),
            endpoint: Mutex::new(None),
            commands: Mutex::new(None),
            subscriber: tokio::sync::Mutex::new(None),
        }
    }

    fn commands(&self) -> BrokerResult<Arc<CommandLink>> {
        self.commands.lock().clone().ok_or(BrokerError::NotConnected)
    }

    /// Current subscriber link, opening a fresh one when absent or dead
    async fn subscriber(&self) -> BrokerResult<Arc<PubSubLink>> {
        let mut slot = self.subscriber.lock().await;
        if let Some(link) = slot.as_ref().filter(|link| !link.is_closed()) {
            return Ok(link.clone());
        }
        let endpoint = self.endpoint.lock().clone().ok_or(BrokerError::NotConnected)?;
        let link = PubSubLink::open(
            &endpoint,
            self.timeouts.connect(),
            self.timeouts.handshake(),
            self.timeouts.rpc(),
            self.state.clone(),
        )
        .await?;
        *slot = Some(link.clone());
        Ok(link)
    }

    async fn open(&self, config: &ConnectionConfig) -> BrokerResult<(RedisEndpoint, CommandLink)> {
        let endpoint = endpoint(config)?;
        info!(host = %endpoint.host, port = endpoint.port, tls = endpoint.tls, db = ?endpoint.database, "Connecting to Redis");
        let link = CommandLink::open(
            &endpoint,
            self.timeouts.connect(),
            self.timeouts.handshake(),
            self.timeouts.rpc(),
            self.state.clone(),
        )
        .await?;
        Ok((endpoint, link))
    }
}

#[async_trait]
impl BasicClient for RedisClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Redis
    }

    async fn connect(&self, config: &ConnectionConfig) -> BrokerResult<()> {
        self.state.begin_connect()?;
        match self.open(config).await {
            Ok((endpoint, link)) => {
                *self.endpoint.lock() = Some(endpoint);
                *self.commands.lock() = Some(Arc::new(link));
                self.state.set(ConnectionState::Connected);
                info!(url = %config.url, "Redis connected");
                Ok(())
            }
            Err(e) => {
                error!(url = %config.url, error = %e, "Redis connect failed");
                self.state.set(ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        if let Some(link) = self.subscriber.lock().await.take() {
            link.close();
        }
        let commands = self.commands.lock().take();
        if let Some(commands) = commands {
            commands.close(self.timeouts.disconnect()).await;
        }
        self.endpoint.lock().take();
        self.state.set(ConnectionState::Disconnected);
        info!("Redis disconnected");
        Ok(())
    }

    async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()> {
        let commands = self.commands()?;
        let reply = commands
            .call(&[b"PUBLISH".as_slice(), subject.as_bytes(), message.payload().as_ref()])
            .await?;
        match reply {
            RespValue::Integer(receivers) => {
                debug!(channel = %subject, receivers, bytes = message.size(), "Published");
                Ok(())
            }
            RespValue::Error(message) => Err(BrokerError::publish_failed(message)),
            other => Err(BrokerError::provider(format!(
                "unexpected PUBLISH reply {:?}",
                other
            ))),
        }
    }

    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription<UnifiedMessage>> {
        if self.commands.lock().is_none() {
            return Err(BrokerError::NotConnected);
        }
        let translated = redis_pattern(pattern);
        let link = self.subscriber().await?;
        let (tx, rx) = Subscription::channel();
        let id = link.subscribe(&translated, tx).await?;
        info!(pattern = %pattern, redis_pattern = %translated, "Redis subscription started");

        let cancel = Arc::new(RedisCancel {
            link: Arc::downgrade(&link),
            pattern: translated,
            id,
            done: AtomicBool::new(false),
        });
        Ok(Subscription::new(pattern, rx, cancel))
    }

    async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        let translated = redis_pattern(pattern);
        let link = self.subscriber.lock().await.clone();
        let removed = link.map(|link| link.release_all(&translated)).unwrap_or(0);
        debug!(pattern = %pattern, removed, "Redis unsubscribe");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
