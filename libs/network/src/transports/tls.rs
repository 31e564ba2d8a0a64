//! TLS client support
//!
//! Server certificates are verified against the Mozilla root set bundled by
//! `webpki-roots`.

use super::BrokerStream;
use crate::{Result, TransportError};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::debug;

fn connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::tls_with_source("Unsupported TLS protocol versions", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run a TLS client handshake over an established plain stream
///
/// Already-encrypted streams are returned unchanged, which lets protocols
/// that announce TLS mid-handshake (NATS `INFO`) call this unconditionally.
pub async fn upgrade_tls(stream: BrokerStream, host: &str) -> Result<BrokerStream> {
    let tcp = match stream {
        BrokerStream::Plain(tcp) => tcp,
        tls @ BrokerStream::Tls(_) => return Ok(tls),
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::tls_with_source(format!("Invalid TLS server name '{}'", host), e))?;

    debug!(host, "Starting TLS handshake");
    let tls = connector()?
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::tls_with_source("TLS handshake failed", e))?;

    Ok(BrokerStream::Tls(Box::new(tls)))
}
