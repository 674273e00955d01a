//! TLS client setup for DNS-over-TLS and DNS-over-HTTPS.

use crate::error::{DnsError, DnsResult};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// ALPN protocol id offered to DoH servers.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Ensure rustls crypto provider is installed.
/// This must be called before using any rustls functionality.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build a client config trusting the webpki root set.
pub fn client_config(alpn: &[&[u8]]) -> Arc<ClientConfig> {
    ensure_crypto_provider();

    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Run a TLS handshake over an already dialed stream.
///
/// `server_name` may be a DNS name or an IP literal; either is verified
/// against the server certificate.
pub async fn connect<S>(
    stream: S,
    server_name: &str,
    config: Arc<ClientConfig>,
) -> DnsResult<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| DnsError::Tls(format!("invalid server name '{}': {}", server_name, e)))?;
    TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| DnsError::Tls(format!("handshake with {} failed: {}", server_name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_alpn() {
        let config = client_config(&[ALPN_HTTP1]);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(client_config(&[]).alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_server_name_rejected() {
        let (client, _server) = tokio::io::duplex(64);
        let err = connect(client, "not a name", client_config(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Tls(_)));
    }
}
