//! Transport Error Types
//!
//! Failures of the byte transport underneath the broker protocols: TCP
//! connect, TLS setup, bounded waits and stream I/O.

use mq_types::BrokerError;
use std::error::Error as StdError;
use thiserror::Error;

type Source = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not reach the broker endpoint
    #[error("Connection error: {message} (remote: {remote})")]
    Connection {
        message: String,
        remote: String,
        source: Option<Source>,
    },

    /// TLS configuration, server name or handshake
    #[error("TLS error: {message}")]
    Tls {
        message: String,
        source: Option<Source>,
    },

    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("I/O error: {source}")]
    Io { source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn connection_with_source(
        message: impl Into<String>,
        remote: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote: remote.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
            source: None,
        }
    }

    pub fn tls_with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Tls {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Worth another connect attempt; certificate and name problems are not
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Tls { .. })
    }

    /// Short label for structured log fields
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "connection",
            TransportError::Tls { .. } => "tls",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Io { .. } => "io",
        }
    }
}

// Sources are not Clone; clones keep the message and drop the chain
impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::Connection {
                message, remote, ..
            } => TransportError::Connection {
                message: message.clone(),
                remote: remote.clone(),
                source: None,
            },
            TransportError::Tls { message, .. } => TransportError::Tls {
                message: message.clone(),
                source: None,
            },
            TransportError::Timeout {
                operation,
                timeout_ms,
            } => TransportError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            TransportError::Io { source } => TransportError::Io {
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(source: std::io::Error) -> Self {
        TransportError::Io { source }
    }
}

impl From<TransportError> for BrokerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { .. } => BrokerError::Timeout,
            other => BrokerError::ConnectionFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_is_retryable() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::connection_with_source("TCP connect failed", "rabbit:5672", refused);
        assert!(err.is_retryable());
        assert_eq!(err.category(), "connection");
        assert!(err.to_string().contains("rabbit:5672"));
    }

    #[test]
    fn test_timeout_maps_to_broker_timeout() {
        let err: BrokerError = TransportError::timeout("connect", 5000).into();
        assert_eq!(err, BrokerError::Timeout);
    }

    #[test]
    fn test_tls_not_retryable() {
        let err = TransportError::tls("bad certificate");
        assert!(!err.is_retryable());
        let broker: BrokerError = err.into();
        assert!(matches!(broker, BrokerError::ConnectionFailed(_)));
    }

    #[test]
    fn test_io_clone_keeps_kind() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        match err.clone() {
            TransportError::Io { source } => {
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
