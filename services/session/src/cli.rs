//! `mqtap` command line

use crate::manager::{resolve_provider, ConnectRequest, SessionMode};
use anyhow::{bail, Context, Result};
use clap::Parser;
use mq_adapters::KafkaClient;
use mq_config::{sanitize_url, ProviderKind, SessionSettings};
use mq_types::UnifiedMessage;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "mqtap")]
#[command(about = "Tap a message broker and print what flows through it")]
#[command(version)]
pub struct TapArgs {
    /// Broker URL (nats://, redis://, kafka://, amqp:// and their TLS variants)
    #[arg(short, long)]
    pub url: String,

    /// Provider id; inferred from the URL scheme when omitted
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Pattern to subscribe to; repeatable
    #[arg(long = "pattern", value_name = "PATTERN")]
    pub patterns: Vec<String>,

    /// Open the session in durable stream mode
    #[arg(long)]
    pub durable: bool,

    /// Messages kept per buffer; overrides the settings file
    #[arg(long)]
    pub retention: Option<usize>,

    /// Settings file (TOML); MQTAP__* environment variables override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Skip the provider's automatic firehose tap
    #[arg(long)]
    pub no_firehose: bool,

    /// Client name announced to the broker
    #[arg(long, default_value = "mqtap")]
    pub name: String,

    /// Enable JSON logging format
    #[arg(long)]
    pub json_logs: bool,
}

impl TapArgs {
    /// Settings file plus environment, with command line overrides applied
    pub fn settings(&self) -> Result<SessionSettings> {
        let mut settings = SessionSettings::load(self.config.as_deref())
            .with_context(|| match &self.config {
                Some(path) => format!("Failed to load settings from {}", path.display()),
                None => "Failed to load settings from environment".to_string(),
            })?;
        if let Some(retention) = self.retention {
            if retention == 0 {
                bail!("--retention must be at least 1");
            }
            settings.retention_limit = retention;
        }
        Ok(settings)
    }

    /// Fail early when the URL needs a client this build does not carry
    pub fn check_backend(&self) -> Result<()> {
        let clean = sanitize_url(&self.url).context("Invalid broker URL")?;
        let mode = self.connect_request().mode;
        let provider = resolve_provider(self.provider.as_deref(), &clean.scheme, mode)?;
        if provider == ProviderKind::Kafka.id() && !KafkaClient::backend_available() {
            bail!("mqtap was built without Kafka support; rebuild with `--features kafka`");
        }
        Ok(())
    }

    pub fn connect_request(&self) -> ConnectRequest {
        let mut request = ConnectRequest::new(self.url.clone())
            .with_name(self.name.clone())
            .with_mode(if self.durable {
                SessionMode::DurableStream
            } else {
                SessionMode::Basic
            });
        request.provider = self.provider.clone();
        if self.no_firehose {
            request.auto_firehose = Some(false);
        }
        request
    }
}

/// One output line per delivery
pub fn render(message: &UnifiedMessage) -> String {
    format!(
        "{} {} ({} bytes) {}",
        message.timestamp().format("%H:%M:%S%.3f"),
        message.subject(),
        message.size(),
        message.payload_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_repeatable_patterns() {
        let args = TapArgs::parse_from([
            "mqtap",
            "--url",
            "nats://127.0.0.1:4222",
            "--pattern",
            "orders.>",
            "--pattern",
            "payments.*",
            "--durable",
        ]);
        assert_eq!(args.patterns, vec!["orders.>", "payments.*"]);
        assert!(args.durable);

        let request = args.connect_request();
        assert_eq!(request.mode, SessionMode::DurableStream);
        assert_eq!(request.provider, None);
        assert_eq!(request.auto_firehose, None);
        assert_eq!(request.name, "mqtap");
    }

    #[test]
    fn test_no_firehose_and_provider() {
        let args = TapArgs::parse_from([
            "mqtap",
            "-u",
            "tls://nats.internal",
            "-p",
            "NATS",
            "--no-firehose",
        ]);
        let request = args.connect_request();
        assert_eq!(request.provider.as_deref(), Some("NATS"));
        assert_eq!(request.auto_firehose, Some(false));
        assert_eq!(request.mode, SessionMode::Basic);
    }

    #[test]
    fn test_settings_file_with_retention_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "retention_limit = 250\nevent_log_limit = 20").unwrap();

        let args = TapArgs::parse_from([
            "mqtap",
            "--url",
            "redis://cache",
            "--config",
            file.path().to_str().unwrap(),
            "--retention",
            "40",
        ]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.retention_limit, 40);
        assert_eq!(settings.event_log_limit, 20);
    }

    #[test]
    fn test_zero_retention_rejected() {
        let args = TapArgs::parse_from(["mqtap", "--url", "redis://cache", "--retention", "0"]);
        assert!(args.settings().is_err());
    }

    #[test]
    fn test_kafka_url_follows_build_features() {
        let kafka = TapArgs::parse_from(["mqtap", "--url", "kafka://broker:9092"]);
        assert_eq!(kafka.check_backend().is_ok(), KafkaClient::backend_available());
        assert_eq!(KafkaClient::backend_available(), cfg!(feature = "kafka"));

        let redis = TapArgs::parse_from(["mqtap", "--url", "redis://cache"]);
        assert!(redis.check_backend().is_ok());
        let unknown = TapArgs::parse_from(["mqtap", "--url", "http://cache"]);
        assert!(unknown.check_backend().is_err());
    }

    #[test]
    fn test_render() {
        let line = render(&UnifiedMessage::new("orders.created", r#"{"id":1}"#));
        assert!(line.ends_with(r#"orders.created (8 bytes) {"id":1}"#));
    }
}
