//! TCP Transport
//!
//! Bounded connect to a broker endpoint, optionally followed by a TLS
//! handshake.

use super::{tls, BrokerStream};
use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Upper bound for resolve + connect + TLS handshake
    pub connect_timeout: Duration,
    /// Disable Nagle; brokers exchange many small frames
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECTION_TIMEOUT_SECS),
            nodelay: true,
        }
    }
}

/// Open a stream to `host:port`, wrapping it in TLS when `tls` is set
pub async fn connect(
    host: &str,
    port: u16,
    tls: bool,
    config: &TcpTransportConfig,
) -> Result<BrokerStream> {
    let remote = format!("{}:{}", host, port);
    debug!(remote = %remote, tls, "Connecting to broker");

    let attempt = async {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::connection_with_source("TCP connect failed", remote.clone(), e))?;

        if config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let stream = BrokerStream::Plain(stream);
        if tls {
            tls::upgrade_tls(stream, host).await
        } else {
            Ok(stream)
        }
    };

    let stream = tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| {
            TransportError::timeout(
                format!("connect to {}", remote),
                config.connect_timeout.as_millis() as u64,
            )
        })??;

    info!(remote = %remote, tls = stream.is_tls(), "Broker transport established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut stream = connect("127.0.0.1", port, false, &TcpTransportConfig::default())
            .await
            .unwrap();
        assert!(!stream.is_tls());
        stream.write_all(b"PING").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"PING");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, false, &TcpTransportConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
    }
}
