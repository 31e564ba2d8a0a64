//! Network Infrastructure
//!
//! Byte transports for broker adapters. Every adapter talks to its broker
//! over one duplex stream; this crate opens it (bounded by a timeout),
//! optionally secures it with rustls, and converts failures into the
//! [`TransportError`] taxonomy which maps onto [`mq_types::BrokerError`].

pub mod error;
pub mod transports;

// Re-export commonly used types
pub use error::{Result, TransportError};
pub use transports::{connect, upgrade_tls, BrokerStream, TcpTransportConfig};

/// Default upper bound for establishing a transport
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
