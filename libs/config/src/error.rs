//! Configuration errors

use mq_types::BrokerError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// URL could not be split into scheme, hosts and path
    #[error("Invalid URL: {reason}")]
    InvalidUrl { reason: String },

    /// Scheme does not map to any provider
    #[error("Unsupported URL scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },

    /// A settings value is out of range
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SettingsError {
    pub fn invalid_url(reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            reason: reason.into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl From<SettingsError> for BrokerError {
    fn from(err: SettingsError) -> Self {
        BrokerError::InvalidConfiguration(err.to_string())
    }
}
