//! Boundary handed to the HTTP/SOCKS5 proxy.
//!
//! The proxy itself is external. It receives a dialer that resolves client
//! hostnames with the `--dns` resolver and a stats source for `/stats`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tunnel_dns::{resolving_dialer, BoxStream, Dial, Lookup, Network, Resolver, ResolverConfig};
use tunnel_wg::stats::{self, Stats};
use tunnel_wg::TunnelDevice;

/// Path the proxy reserves for the stats snapshot.
pub const STATS_PATH: &str = "/stats";

/// Dialer and stats source for the proxy layer.
#[derive(Clone)]
pub struct ProxyBoundary {
    dialer: Arc<dyn Dial>,
    device: Arc<dyn TunnelDevice>,
}

impl ProxyBoundary {
    /// Route connections over `dial`, resolving names with `dns`.
    pub fn new(
        dns: ResolverConfig,
        dial: Arc<dyn Dial>,
        device: Arc<dyn TunnelDevice>,
    ) -> Result<Self> {
        let transport = dns.transport_name();
        let resolver = Resolver::new(dns, dial.clone())
            .with_context(|| format!("Failed to create {} resolver for proxy", transport))?;
        Ok(Self::with_lookup(dial, Arc::new(resolver), device))
    }

    pub fn with_lookup(
        dial: Arc<dyn Dial>,
        lookup: Arc<dyn Lookup>,
        device: Arc<dyn TunnelDevice>,
    ) -> Self {
        Self {
            dialer: Arc::new(resolving_dialer(dial, lookup)),
            device,
        }
    }

    /// Connect to `address` (`host:port`) on behalf of a proxy client.
    pub async fn dial(&self, network: Network, address: &str) -> std::io::Result<BoxStream> {
        self.dialer.dial(network, address).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        stats::snapshot(self.device.as_ref())
            .await
            .context("Failed to read device stats")
    }

    /// Stats rendered as the body served on [`STATS_PATH`].
    pub async fn stats_json(&self) -> Result<String> {
        let stats = self.stats().await?;
        let mut body = serde_json::to_string_pretty(&stats)?;
        body.push('\n');
        Ok(body)
    }
}
