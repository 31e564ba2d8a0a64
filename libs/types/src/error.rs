//! Broker Error Taxonomy
//!
//! The closed set of failures callers of any adapter can observe. Codec and
//! transport layers keep their own detailed error types and convert into
//! [`BrokerError`] at the adapter boundary.

use thiserror::Error;

/// Result alias used across adapters and the orchestrator
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Unified broker error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connect, handshake or transport failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation issued while no connection is established
    #[error("Not connected")]
    NotConnected,

    /// Subscription could not be set up or was terminated by the broker
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Message could not be published
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The backend has no notion of the requested operation
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// A bounded wait expired
    #[error("Operation timed out")]
    Timeout,

    /// Bad URL, options or settings
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Backend-specific failure reported by the broker or its client library
    #[error("Provider error: {0}")]
    ProviderError(String),
}

impl BrokerError {
    /// Create a connection failure
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a subscription failure
    pub fn subscription_failed(message: impl Into<String>) -> Self {
        Self::SubscriptionFailed(message.into())
    }

    /// Create a publish failure
    pub fn publish_failed(message: impl Into<String>) -> Self {
        Self::PublishFailed(message.into())
    }

    /// Create an unsupported-operation error
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::OperationNotSupported(operation.into())
    }

    /// Create a configuration error
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Create a provider error
    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderError(message.into())
    }

    /// Error returned by every acknowledgement action after the first
    pub fn message_unavailable() -> Self {
        Self::ProviderError("message no longer available".to_string())
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::NotConnected | Self::Timeout
        )
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection",
            Self::NotConnected => "state",
            Self::SubscriptionFailed(_) => "subscription",
            Self::PublishFailed(_) => "publish",
            Self::OperationNotSupported(_) => "unsupported",
            Self::Timeout => "timeout",
            Self::InvalidConfiguration(_) => "configuration",
            Self::ProviderError(_) => "provider",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BrokerError::connection_failed("refused");
        assert!(matches!(err, BrokerError::ConnectionFailed(_)));
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_message_unavailable() {
        let err = BrokerError::message_unavailable();
        assert_eq!(
            err,
            BrokerError::ProviderError("message no longer available".into())
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(BrokerError::Timeout.category(), "timeout");
        assert_eq!(BrokerError::NotConnected.category(), "state");
        assert_eq!(BrokerError::not_supported("request").category(), "unsupported");
    }

    #[test]
    fn test_retryable() {
        assert!(BrokerError::Timeout.is_retryable());
        assert!(BrokerError::NotConnected.is_retryable());
        assert!(!BrokerError::invalid_configuration("bad url").is_retryable());
    }
}
