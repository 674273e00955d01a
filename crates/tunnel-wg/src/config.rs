//! WireGuard interface and peer configuration.

use crate::keys::{ClientId, WgKey};
use std::time::Duration;
use tunnel_dns::{HostPort, ResolverConfig};

/// Default MTU of the user-space network.
pub const DEFAULT_MTU: u16 = 1280;

/// Default interval between peer endpoint lookups.
pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(60);

/// Keepalive used in local exit mode when none is configured.
pub const DEFAULT_LOCAL_KEEPALIVE: Duration = Duration::from_secs(10);

/// The remote WireGuard peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// `[Peer].PublicKey`
    pub public_key: WgKey,
    /// `[Peer].PresharedKey`
    pub preshared_key: Option<WgKey>,
    /// `[Peer].Endpoint`, host may be a name or an IP literal.
    pub endpoint: HostPort,
    /// `[Peer].PersistentKeepalive`
    pub keepalive: Option<Duration>,
}

impl PeerConfig {
    pub fn new(public_key: WgKey, endpoint: HostPort) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint,
            keepalive: None,
        }
    }

    pub fn with_preshared_key(mut self, key: WgKey) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Set the keepalive interval. A zero interval disables keepalives.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = (!interval.is_zero()).then_some(interval);
        self
    }
}

/// Local interface plus its single peer.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// `[Interface].PrivateKey`
    pub private_key: WgKey,
    /// `[Interface].ListenPort`
    pub listen_port: Option<u16>,
    pub peer: PeerConfig,
    /// Resolver used for the peer endpoint.
    pub resolve_dns: ResolverConfig,
    /// Refresh interval for the peer endpoint. Zero disables refreshing.
    pub resolve_interval: Duration,
    /// Written into the reserved header bytes when set.
    pub client_id: Option<ClientId>,
}

impl InterfaceConfig {
    pub fn new(private_key: WgKey, peer: PeerConfig) -> Self {
        Self {
            private_key,
            listen_port: None,
            peer,
            resolve_dns: ResolverConfig::System,
            resolve_interval: DEFAULT_RESOLVE_INTERVAL,
            client_id: None,
        }
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    pub fn with_resolver(mut self, resolve_dns: ResolverConfig) -> Self {
        self.resolve_dns = resolve_dns;
        self
    }

    pub fn with_resolve_interval(mut self, interval: Duration) -> Self {
        self.resolve_interval = interval;
        self
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }
}
