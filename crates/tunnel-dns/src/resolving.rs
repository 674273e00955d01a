//! Dialer that resolves host names before connecting.

use crate::config::HostPort;
use crate::dial::{BoxStream, Dial, Network};
use crate::resolver::Lookup;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Wraps a [`Dial`] so `host:port` targets are resolved with a [`Lookup`]
/// and each address is tried in order.
#[derive(Clone)]
pub struct ResolvingDialer {
    inner: Arc<dyn Dial>,
    lookup: Arc<dyn Lookup>,
}

/// Wrap `dial` so host names are resolved through `lookup`.
pub fn resolving_dialer(dial: Arc<dyn Dial>, lookup: Arc<dyn Lookup>) -> ResolvingDialer {
    ResolvingDialer {
        inner: dial,
        lookup,
    }
}

#[async_trait]
impl Dial for ResolvingDialer {
    async fn dial(&self, network: Network, address: &str) -> io::Result<BoxStream> {
        let target = HostPort::parse(address)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        if target.ip().is_some() {
            return self.inner.dial(network, address).await;
        }

        let ips = self
            .lookup
            .lookup_ip(&target.host)
            .await
            .map_err(|e| e.into_io())?;

        let mut last_err = None;
        for ip in ips {
            let addr = SocketAddr::new(ip, target.port).to_string();
            match self.inner.dial(network, &addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    log::debug!("dial {} {} ({}) failed: {}", network, addr, target.host, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| no_addresses(&target.host)))
    }
}

fn no_addresses(host: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no addresses found for {}", host),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DnsError, DnsResult};
    use std::net::IpAddr;
    use std::sync::Mutex;

    struct FixedLookup(Vec<IpAddr>);

    #[async_trait]
    impl Lookup for FixedLookup {
        async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
            if self.0.is_empty() {
                return Err(DnsError::NoAddresses(host.to_string()));
            }
            Ok(self.0.clone())
        }
    }

    /// Succeeds only for `accept`, recording every attempt.
    struct PickyDialer {
        accept: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl PickyDialer {
        fn new(accept: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                accept: accept.map(str::to_string),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Dial for PickyDialer {
        async fn dial(&self, _network: Network, address: &str) -> io::Result<BoxStream> {
            self.calls.lock().unwrap().push(address.to_string());
            if self.accept.as_deref() == Some(address) {
                let (client, _server) = tokio::io::duplex(64);
                Ok(Box::new(client))
            } else {
                Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("refused {}", address),
                ))
            }
        }
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_tries_addresses_in_order() {
        let inner = PickyDialer::new(Some("[2001:db8::2]:443"));
        let lookup = Arc::new(FixedLookup(ips(&["192.0.2.1", "2001:db8::2", "192.0.2.3"])));
        let dialer = resolving_dialer(inner.clone(), lookup);

        assert!(dialer.dial(Network::Tcp, "example.test:443").await.is_ok());
        assert_eq!(
            *inner.calls.lock().unwrap(),
            vec!["192.0.2.1:443", "[2001:db8::2]:443"]
        );
    }

    #[tokio::test]
    async fn test_returns_last_error() {
        let inner = PickyDialer::new(None);
        let lookup = Arc::new(FixedLookup(ips(&["192.0.2.1", "192.0.2.2"])));
        let dialer = resolving_dialer(inner.clone(), lookup);

        let err = match dialer.dial(Network::Tcp, "example.test:80").await {
            Err(e) => e,
            Ok(_) => panic!("dial should fail"),
        };
        assert_eq!(err.to_string(), "refused 192.0.2.2:80");
        assert_eq!(inner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_literal_ip_bypasses_lookup() {
        let inner = PickyDialer::new(Some("192.0.2.9:53"));
        let dialer = resolving_dialer(inner.clone(), Arc::new(FixedLookup(Vec::new())));

        assert!(dialer.dial(Network::Udp, "192.0.2.9:53").await.is_ok());
        assert_eq!(*inner.calls.lock().unwrap(), vec!["192.0.2.9:53"]);
    }

    #[tokio::test]
    async fn test_lookup_failure_surfaces() {
        let inner = PickyDialer::new(None);
        let dialer = resolving_dialer(inner.clone(), Arc::new(FixedLookup(Vec::new())));

        assert!(dialer.dial(Network::Tcp, "missing.test:80").await.is_err());
        assert!(dialer.dial(Network::Tcp, "no-port").await.is_err());
        assert!(inner.calls.lock().unwrap().is_empty());
    }
}
