//! Provider registry
//!
//! Maps a lowercase provider id to the constructors for its adapters. The
//! built-in providers are installed by [`bootstrap`], which runs at most once
//! per [`BootstrapState`] value.

use crate::amqp::AmqpClient;
use crate::common::{BasicClient, StreamingClient};
use crate::jetstream::JetStreamClient;
use crate::kafka::KafkaClient;
use crate::nats::NatsClient;
use crate::redis::RedisClient;
use mq_config::{ProviderKind, SessionSettings};
use mq_types::{BrokerError, BrokerResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub type BasicFactory = Arc<dyn Fn(&SessionSettings) -> Arc<dyn BasicClient> + Send + Sync>;
pub type StreamingFactory =
    Arc<dyn Fn(&SessionSettings) -> Arc<dyn StreamingClient> + Send + Sync>;

/// The adapter instance selected for one connection
#[derive(Clone)]
pub struct AdapterHandle {
    pub basic: Arc<dyn BasicClient>,
    /// Present when streaming was requested and the provider offers it;
    /// `basic` is then the same instance
    pub streaming: Option<Arc<dyn StreamingClient>>,
}

impl fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("provider", &self.basic.provider())
            .field("streaming", &self.streaming.is_some())
            .finish()
    }
}

struct ProviderEntry {
    basic: BasicFactory,
    streaming: Option<StreamingFactory>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().collect();
        ids.sort();
        f.debug_struct("ProviderRegistry").field("providers", &ids).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers installed
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        bootstrap(&mut registry, &mut BootstrapState::default());
        registry
    }

    /// Register or replace a provider; the id is stored lowercased
    pub fn register(
        &mut self,
        id: &str,
        basic: BasicFactory,
        streaming: Option<StreamingFactory>,
    ) {
        let id = id.trim().to_ascii_lowercase();
        debug!(provider = %id, streaming = streaming.is_some(), "Registering provider");
        self.entries.insert(id, ProviderEntry { basic, streaming });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&id.trim().to_ascii_lowercase())
    }

    pub fn supports_streaming(&self, id: &str) -> bool {
        self.entries
            .get(&id.trim().to_ascii_lowercase())
            .is_some_and(|entry| entry.streaming.is_some())
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Construct the adapter for `id`
    ///
    /// With `streaming` set, providers that offer a streaming constructor
    /// return one instance serving both contracts.
    pub fn create(
        &self,
        id: &str,
        settings: &SessionSettings,
        streaming: bool,
    ) -> BrokerResult<AdapterHandle> {
        let key = id.trim().to_ascii_lowercase();
        let entry = self.entries.get(&key).ok_or_else(|| {
            BrokerError::invalid_configuration(format!("unknown provider '{}'", key))
        })?;

        match (&entry.streaming, streaming) {
            (Some(factory), true) => {
                let client = factory(settings);
                Ok(AdapterHandle {
                    basic: client.clone().as_basic(),
                    streaming: Some(client),
                })
            }
            _ => Ok(AdapterHandle {
                basic: (entry.basic)(settings),
                streaming: None,
            }),
        }
    }
}

/// One-shot guard for [`bootstrap`]
#[derive(Debug, Default)]
pub struct BootstrapState {
    done: bool,
}

impl BootstrapState {
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Install the built-in providers; later calls with the same state are no-ops
pub fn bootstrap(registry: &mut ProviderRegistry, state: &mut BootstrapState) {
    if state.done {
        return;
    }

    registry.register(
        ProviderKind::Nats.id(),
        Arc::new(|settings: &SessionSettings| -> Arc<dyn BasicClient> {
            Arc::new(NatsClient::new(settings))
        }),
        None,
    );

    let jetstream_basic: BasicFactory = Arc::new(|settings: &SessionSettings| -> Arc<dyn BasicClient> {
        Arc::new(JetStreamClient::new(settings))
    });
    let jetstream_streaming: StreamingFactory =
        Arc::new(|settings: &SessionSettings| -> Arc<dyn StreamingClient> {
            Arc::new(JetStreamClient::new(settings))
        });
    registry.register(
        ProviderKind::JetStream.id(),
        jetstream_basic,
        Some(jetstream_streaming),
    );

    registry.register(
        ProviderKind::Redis.id(),
        Arc::new(|settings: &SessionSettings| -> Arc<dyn BasicClient> {
            Arc::new(RedisClient::new(settings))
        }),
        None,
    );

    registry.register(
        ProviderKind::Kafka.id(),
        Arc::new(|settings: &SessionSettings| -> Arc<dyn BasicClient> {
            Arc::new(KafkaClient::with_default_backend(settings))
        }),
        None,
    );

    registry.register(
        ProviderKind::Amqp.id(),
        Arc::new(|settings: &SessionSettings| -> Arc<dyn BasicClient> {
            Arc::new(AmqpClient::new(settings))
        }),
        None,
    );

    state.done = true;
    info!(providers = ?registry.provider_ids(), "Provider registry bootstrapped");
}
