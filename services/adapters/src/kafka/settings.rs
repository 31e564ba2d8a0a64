//! Client settings passed through the `kafka_config` connection option
//!
//! The JSON document is translated key by key into librdkafka properties.
//! Nothing here is interpreted by the adapter itself.

use mq_types::{BrokerError, BrokerResult, ConnectionConfig};
use serde::{Deserialize, Serialize};

/// Connection option key carrying a JSON [`KafkaSettings`] document
pub const KAFKA_CONFIG_OPTION: &str = "kafka_config";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub ssl_certificate_location: Option<String>,
    pub ssl_key_location: Option<String>,
    pub client_id: Option<String>,
    pub request_timeout_ms: Option<u32>,
    pub session_timeout_ms: Option<u32>,
    pub acks: Option<String>,
    pub retries: Option<u32>,
    pub compression_type: Option<String>,
    pub batch_size: Option<u32>,
    pub linger_ms: Option<u32>,
    pub group_id: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub enable_auto_commit: Option<bool>,
}

impl KafkaSettings {
    /// Settings from the connection options, with URL credentials and the
    /// TLS flag filling gaps the JSON leaves open
    pub fn from_config(config: &ConnectionConfig) -> BrokerResult<Self> {
        let mut settings = match config.option(KAFKA_CONFIG_OPTION) {
            Some(raw) => serde_json::from_str::<Self>(raw).map_err(|e| {
                BrokerError::invalid_configuration(format!("{}: {}", KAFKA_CONFIG_OPTION, e))
            })?,
            None => Self::default(),
        };

        let has_credentials = config.username.is_some() && config.password.is_some();
        if has_credentials && settings.sasl_username.is_none() {
            settings.sasl_username = config.username.clone();
            settings.sasl_password = config.password.clone();
            settings.sasl_mechanism.get_or_insert_with(|| "PLAIN".to_string());
        }
        if settings.security_protocol.is_none() {
            let sasl = settings.sasl_username.is_some();
            settings.security_protocol = match (config.tls, sasl) {
                (true, true) => Some("SASL_SSL".to_string()),
                (true, false) => Some("SSL".to_string()),
                (false, true) => Some("SASL_PLAINTEXT".to_string()),
                (false, false) => None,
            };
        }
        Ok(settings)
    }

    /// librdkafka client properties shared by producers and consumers
    pub fn client_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = Vec::new();
        push(&mut props, "security.protocol", &self.security_protocol);
        push(&mut props, "sasl.mechanism", &self.sasl_mechanism);
        push(&mut props, "sasl.username", &self.sasl_username);
        push(&mut props, "sasl.password", &self.sasl_password);
        push(&mut props, "ssl.ca.location", &self.ssl_ca_location);
        push(&mut props, "ssl.certificate.location", &self.ssl_certificate_location);
        push(&mut props, "ssl.key.location", &self.ssl_key_location);
        push(&mut props, "client.id", &self.client_id);
        push(&mut props, "request.timeout.ms", &self.request_timeout_ms);
        props
    }

    pub fn producer_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = self.client_properties();
        push(&mut props, "acks", &self.acks);
        push(&mut props, "retries", &self.retries);
        push(&mut props, "compression.type", &self.compression_type);
        push(&mut props, "batch.size", &self.batch_size);
        push(&mut props, "linger.ms", &self.linger_ms);
        props
    }

    pub fn consumer_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = self.client_properties();
        push(&mut props, "session.timeout.ms", &self.session_timeout_ms);
        push(&mut props, "group.id", &self.group_id);
        push(&mut props, "auto.offset.reset", &self.auto_offset_reset);
        push(&mut props, "enable.auto.commit", &self.enable_auto_commit);
        props
    }
}

fn push<T: ToString>(props: &mut Vec<(&'static str, String)>, key: &'static str, value: &Option<T>) {
    if let Some(value) = value {
        props.push((key, value.to_string()));
    }
}
