//! # mqtap Adapters - Unified Broker Client Layer
//!
//! ## Purpose
//!
//! Protocol adapters that put four very different brokers behind one client
//! contract. The session orchestrator only ever sees [`BasicClient`] and,
//! for persistent streams, [`StreamingClient`]; every wire protocol detail
//! stays inside its adapter module.
//!
//! ## Providers
//!
//! | Id | Module | Protocol | Streaming |
//! |----|--------|----------|-----------|
//! | `amqp` | [`amqp`] | AMQP 0-9-1 over TCP/TLS | no |
//! | `nats` | [`nats`] | NATS client protocol | no |
//! | `jetstream` | [`jetstream`] | NATS + `$JS.API` JSON | yes |
//! | `kafka` | [`kafka`] | librdkafka (feature `kafka`) or in-memory log | no |
//! | `redis` | [`redis`] | RESP2 pub/sub | no |
//!
//! ## Architecture Role
//!
//! ```text
//! ConnectionManager ──► ProviderRegistry ──► Arc<dyn BasicClient>
//!                                               │
//!                         receive task ──► Subscription (mpsc) ──► intake
//! ```
//!
//! Every connection owns its background tasks through a [`TaskSet`]; a
//! subscription holds only a `Weak` reference back to its connection, so
//! dropping the client tears everything down.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mq_adapters::{bootstrap, BootstrapState, ProviderRegistry};
//! use mq_config::SessionSettings;
//! use mq_types::{ConnectionConfig, UnifiedMessage};
//!
//! # async fn demo() -> mq_types::BrokerResult<()> {
//! let mut registry = ProviderRegistry::new();
//! bootstrap(&mut registry, &mut BootstrapState::default());
//!
//! let handle = registry.create("nats", &SessionSettings::default(), false)?;
//! handle.basic.connect(&ConnectionConfig::new("nats://127.0.0.1:4222")).await?;
//! let mut orders = handle.basic.subscribe("orders.>").await?;
//! handle.basic.publish(UnifiedMessage::new("orders.created", "{}"), "orders.created").await?;
//! if let Some(Ok(message)) = orders.recv().await {
//!     println!("{} {}", message.subject(), message.payload_str());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod common;
pub mod registry;

pub mod amqp;
pub mod jetstream;
pub mod kafka;
pub mod nats;
pub mod redis;

pub use common::{
    spawn_detached, BasicClient, CancelHandle, StateNotifier, StreamingClient, Subscription,
    SubscriptionSender, TaskSet,
};
pub use registry::{
    bootstrap, AdapterHandle, BasicFactory, BootstrapState, ProviderRegistry, StreamingFactory,
};

pub use amqp::AmqpClient;
pub use jetstream::JetStreamClient;
pub use kafka::{KafkaClient, MemoryLog};
pub use nats::NatsClient;
pub use redis::RedisClient;
