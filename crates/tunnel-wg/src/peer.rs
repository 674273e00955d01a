//! Peer endpoint lifecycle.
//!
//! A peer whose endpoint is a host name is resolved at startup, probed for
//! reachability, and re-resolved on a fixed interval. When the address
//! changes, a minimal update block is pushed to the device. A peer given as
//! an IP literal is configured once and never touched again.

use crate::config::{InterfaceConfig, PeerConfig};
use crate::device::TunnelDevice;
use crate::error::{WgError, WgResult};
use crate::ipc::{DeviceConfig, PeerUpdate};
use crate::keys::WgKey;
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tunnel_dns::Lookup;

/// Deadline for one refresh cycle, lookup and reachability checks included.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Checks whether a candidate endpoint is routable from this host.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> io::Result<()>;
}

/// Connects an unbound UDP socket to the candidate. No data is sent; the
/// host routing table decides whether the address is usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpProbe;

#[async_trait]
impl Reachability for UdpProbe {
    async fn probe(&self, addr: SocketAddr) -> io::Result<()> {
        let local = match addr.ip() {
            IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            IpAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await
    }
}

/// The remote peer and its current endpoint.
pub struct Peer {
    public_key: WgKey,
    preshared_key: Option<WgKey>,
    host: String,
    port: u16,
    resolved: SocketAddr,
    keepalive: Option<Duration>,
    resolver: Option<Arc<dyn Lookup>>,
    probe: Arc<dyn Reachability>,
}

impl Peer {
    /// Resolve the configured endpoint with the default UDP probe.
    ///
    /// `make_resolver` is only called when the host is not an IP literal.
    pub async fn resolve<F>(config: &PeerConfig, make_resolver: F) -> WgResult<Self>
    where
        F: FnOnce() -> WgResult<Arc<dyn Lookup>>,
    {
        Self::resolve_with_probe(config, make_resolver, Arc::new(UdpProbe)).await
    }

    pub async fn resolve_with_probe<F>(
        config: &PeerConfig,
        make_resolver: F,
        probe: Arc<dyn Reachability>,
    ) -> WgResult<Self>
    where
        F: FnOnce() -> WgResult<Arc<dyn Lookup>>,
    {
        let host = config.endpoint.host.clone();
        let port = config.endpoint.port;

        let (resolved, resolver) = match config.endpoint.ip() {
            Some(ip) => (SocketAddr::new(ip, port), None),
            None => {
                let resolver = make_resolver()?;
                let resolved = resolve_endpoint(resolver.as_ref(), probe.as_ref(), &host, port)
                    .await?;
                log::info!("Peer endpoint {} resolved to {}", config.endpoint, resolved);
                (resolved, Some(resolver))
            }
        };

        Ok(Self {
            public_key: config.public_key,
            preshared_key: config.preshared_key,
            host,
            port,
            resolved,
            keepalive: config.keepalive,
            resolver,
            probe,
        })
    }

    /// Current endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        self.resolved
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn public_key(&self) -> &WgKey {
        &self.public_key
    }

    /// True when the endpoint was an IP literal and is never refreshed.
    pub fn is_static(&self) -> bool {
        self.resolver.is_none()
    }

    /// Full device configuration for this peer behind `interface`.
    pub fn device_config(&self, interface: &InterfaceConfig) -> DeviceConfig {
        DeviceConfig {
            private_key: interface.private_key,
            listen_port: interface.listen_port,
            public_key: self.public_key,
            endpoint: self.resolved,
            keepalive: self.keepalive,
            preshared_key: self.preshared_key,
        }
    }

    /// Re-resolve the endpoint.
    ///
    /// Returns an update block only when the address changed. Lookup and
    /// probe failures are logged and keep the current address.
    pub async fn refresh(&mut self) -> Option<PeerUpdate> {
        let resolver = self.resolver.as_ref()?;
        let resolved =
            match resolve_endpoint(resolver.as_ref(), self.probe.as_ref(), &self.host, self.port)
                .await
            {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("Resolve peer endpoint {}: {}", self.host, e);
                    return None;
                }
            };
        if resolved == self.resolved {
            return None;
        }

        self.resolved = resolved;
        log::info!("Peer endpoint changed to {}", resolved);
        Some(PeerUpdate {
            public_key: self.public_key,
            endpoint: resolved,
        })
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("resolved", &self.resolved)
            .field("keepalive", &self.keepalive)
            .field("static", &self.is_static())
            .finish()
    }
}

/// Look up `host` and return the first candidate that passes the probe.
async fn resolve_endpoint(
    resolver: &dyn Lookup,
    probe: &dyn Reachability,
    host: &str,
    port: u16,
) -> WgResult<SocketAddr> {
    let candidates = resolver.lookup_ip(host).await?;
    let mut last_err = None;
    for ip in candidates {
        let addr = SocketAddr::new(ip, port);
        match probe.probe(addr).await {
            Ok(()) => return Ok(addr),
            Err(e) => {
                log::debug!("Peer candidate {} unreachable: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(WgError::Resolve(match last_err {
        Some(e) => format!("no reachable address for {}:{}: {}", host, port, e),
        None => format!("no address for {}:{}", host, port),
    }))
}

/// Applies the peer to a device and keeps its endpoint current.
pub struct PeerManager {
    device: Arc<dyn TunnelDevice>,
    interval: Duration,
}

impl PeerManager {
    pub fn new(device: Arc<dyn TunnelDevice>, interval: Duration) -> Self {
        Self { device, interval }
    }

    /// Submit the full configuration, then start refreshing if needed.
    ///
    /// No task is started for a static peer or a zero interval.
    pub async fn start(
        self,
        interface: &InterfaceConfig,
        peer: Peer,
    ) -> WgResult<Option<RefreshHandle>> {
        let config = peer.device_config(interface);
        self.device.ipc_set(&config.to_string()).await?;
        log::info!("Device configured with peer endpoint {}", peer.endpoint());

        if peer.is_static() {
            log::debug!("Peer endpoint is an IP literal, not refreshing");
            return Ok(None);
        }
        if self.interval.is_zero() {
            log::debug!("Peer endpoint refresh disabled");
            return Ok(None);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run_refresh(
            peer,
            self.device,
            self.interval,
            shutdown_rx,
        ));
        Ok(Some(RefreshHandle {
            shutdown_tx,
            handle: Some(handle),
        }))
    }

    async fn run_refresh(
        mut peer: Peer,
        device: Arc<dyn TunnelDevice>,
        period: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // A stalled lookup must not keep shutdown waiting.
                    tokio::select! {
                        _ = Self::refresh_once(&mut peer, device.as_ref()) => {}
                        _ = shutdown_rx.changed() => {
                            log::debug!("Peer endpoint refresh stopped during lookup");
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        log::debug!("Peer endpoint refresh stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh_once(peer: &mut Peer, device: &dyn TunnelDevice) {
        let update = match tokio::time::timeout(REFRESH_TIMEOUT, peer.refresh()).await {
            Ok(update) => update,
            Err(_) => {
                log::warn!(
                    "Resolve peer endpoint {}: timed out after {:?}",
                    peer.host(),
                    REFRESH_TIMEOUT
                );
                return;
            }
        };
        if let Some(update) = update {
            if let Err(e) = device.ipc_set(&update.to_string()).await {
                log::error!("Config device: {}", e);
            }
        }
    }
}

/// Handle to the refresh task. Dropping it stops the task.
pub struct RefreshHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Signal the task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal the task to stop and wait for it.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tunnel_dns::{DnsError, DnsResult, HostPort};

    /// Returns queued answers in order, repeating the last one.
    struct ScriptedLookup {
        answers: Mutex<VecDeque<DnsResult<Vec<IpAddr>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLookup {
        fn new(answers: Vec<DnsResult<Vec<IpAddr>>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Lookup for ScriptedLookup {
        async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            let answer = if answers.len() > 1 {
                answers.pop_front()
            } else {
                answers.front().map(|a| match a {
                    Ok(ips) => Ok(ips.clone()),
                    Err(_) => Err(DnsError::NoAddresses(host.to_string())),
                })
            };
            answer.unwrap_or_else(|| Err(DnsError::NoAddresses(host.to_string())))
        }
    }

    /// Answers the startup lookup, then never answers again.
    #[derive(Default)]
    struct StallingLookup {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Lookup for StallingLookup {
        async fn lookup_ip(&self, _host: &str) -> DnsResult<Vec<IpAddr>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(vec!["192.0.2.1".parse().unwrap()]);
            }
            std::future::pending().await
        }
    }

    /// Rejects a fixed set of addresses.
    #[derive(Default)]
    struct BlockList(HashSet<IpAddr>);

    #[async_trait]
    impl Reachability for BlockList {
        async fn probe(&self, addr: SocketAddr) -> io::Result<()> {
            if self.0.contains(&addr.ip()) {
                Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "unreachable"))
            } else {
                Ok(())
            }
        }
    }

    /// Records every submitted block; can be told to fail.
    #[derive(Default)]
    struct RecordingDevice {
        blocks: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TunnelDevice for RecordingDevice {
        async fn ipc_set(&self, block: &str) -> WgResult<()> {
            self.blocks.lock().unwrap().push(block.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(WgError::Device("errno=1".into()));
            }
            Ok(())
        }

        async fn ipc_get(&self) -> WgResult<String> {
            Ok(String::new())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn peer_config(host: &str) -> PeerConfig {
        PeerConfig::new(WgKey::from_bytes([0x22; 32]), HostPort::new(host, 51820))
    }

    fn interface(peer: PeerConfig) -> InterfaceConfig {
        InterfaceConfig::new(WgKey::from_bytes([0x11; 32]), peer)
    }

    fn open() -> Arc<dyn Reachability> {
        Arc::new(BlockList::default())
    }

    #[tokio::test]
    async fn test_literal_ip_never_builds_resolver() {
        let config = peer_config("192.0.2.1");
        let peer = Peer::resolve(&config, || panic!("resolver must not be built"))
            .await
            .unwrap();
        assert!(peer.is_static());
        assert_eq!(peer.endpoint(), "192.0.2.1:51820".parse().unwrap());

        let device = Arc::new(RecordingDevice::default());
        let handle = PeerManager::new(device.clone(), Duration::from_secs(60))
            .start(&interface(config), peer)
            .await
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(device.blocks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_reachable_candidate_wins() {
        let lookup = ScriptedLookup::new(vec![Ok(vec![ip("192.0.2.1"), ip("192.0.2.2")])]);
        let probe = Arc::new(BlockList([ip("192.0.2.1")].into_iter().collect()));
        let peer = Peer::resolve_with_probe(
            &peer_config("vpn.example"),
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            probe,
        )
        .await
        .unwrap();
        assert_eq!(peer.endpoint(), "192.0.2.2:51820".parse().unwrap());
        assert!(!peer.is_static());
    }

    #[tokio::test]
    async fn test_no_reachable_candidate_is_fatal() {
        let lookup = ScriptedLookup::new(vec![Ok(vec![ip("192.0.2.1")])]);
        let probe = Arc::new(BlockList([ip("192.0.2.1")].into_iter().collect()));
        let err = Peer::resolve_with_probe(
            &peer_config("vpn.example"),
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            probe,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WgError::Resolve(_)));

        let lookup = ScriptedLookup::new(vec![Err(DnsError::NoAddresses("vpn.example".into()))]);
        let err = Peer::resolve_with_probe(
            &peer_config("vpn.example"),
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WgError::Dns(_)));
    }

    #[tokio::test]
    async fn test_udp_probe_accepts_loopback() {
        assert!(UdpProbe.probe("127.0.0.1:51820".parse().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let lookup = ScriptedLookup::new(vec![Ok(vec![ip("192.0.2.1")])]);
        let mut peer = Peer::resolve_with_probe(
            &peer_config("vpn.example"),
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        for _ in 0..3 {
            assert!(peer.refresh().await.is_none());
        }
        assert_eq!(peer.endpoint(), "192.0.2.1:51820".parse().unwrap());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_refresh_reports_change_once() {
        let lookup = ScriptedLookup::new(vec![
            Ok(vec![ip("192.0.2.1")]),
            Ok(vec![ip("198.51.100.9")]),
        ]);
        let mut peer = Peer::resolve_with_probe(
            &peer_config("vpn.example"),
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        let update = peer.refresh().await.unwrap();
        assert_eq!(update.endpoint, "198.51.100.9:51820".parse().unwrap());
        assert_eq!(
            update.to_string(),
            format!(
                "public_key={}\nupdate_only=true\nendpoint=198.51.100.9:51820\n",
                "22".repeat(32)
            )
        );
        assert!(peer.refresh().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_endpoint() {
        let lookup = ScriptedLookup::new(vec![
            Ok(vec![ip("192.0.2.1")]),
            Err(DnsError::NoAddresses("vpn.example".into())),
        ]);
        let mut peer = Peer::resolve_with_probe(
            &peer_config("vpn.example"),
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        assert!(peer.refresh().await.is_none());
        assert_eq!(peer.endpoint(), "192.0.2.1:51820".parse().unwrap());
    }

    #[tokio::test]
    async fn test_zero_interval_starts_no_task() {
        let lookup = ScriptedLookup::new(vec![Ok(vec![ip("192.0.2.1")])]);
        let config = peer_config("vpn.example");
        let peer = Peer::resolve_with_probe(
            &config,
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        let device = Arc::new(RecordingDevice::default());
        let handle = PeerManager::new(device.clone(), Duration::ZERO)
            .start(&interface(config), peer)
            .await
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(device.blocks.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_task_submits_changes_only() {
        let lookup = ScriptedLookup::new(vec![
            Ok(vec![ip("192.0.2.1")]),
            Ok(vec![ip("192.0.2.1")]),
            Ok(vec![ip("198.51.100.9")]),
        ]);
        let config = peer_config("vpn.example");
        let peer = Peer::resolve_with_probe(
            &config,
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        let device = Arc::new(RecordingDevice::default());
        let handle = PeerManager::new(device.clone(), Duration::from_secs(10))
            .start(&interface(config), peer)
            .await
            .unwrap()
            .unwrap();

        // Initial block only until the first tick.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(device.blocks.lock().unwrap().len(), 1);
        assert!(device.blocks.lock().unwrap()[0].starts_with("private_key="));

        // Tick 1 sees no change, tick 2 sees the new address.
        tokio::time::sleep(Duration::from_secs(20)).await;
        {
            let blocks = device.blocks.lock().unwrap();
            assert_eq!(blocks.len(), 2);
            assert!(blocks[1].contains("update_only=true"));
            assert!(blocks[1].contains("endpoint=198.51.100.9:51820"));
        }

        handle.stop().await;
        let calls = lookup.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lookup_times_out_and_stops() {
        let lookup = Arc::new(StallingLookup::default());
        let config = peer_config("vpn.example");
        let peer = Peer::resolve_with_probe(
            &config,
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        let device = Arc::new(RecordingDevice::default());
        let handle = PeerManager::new(device.clone(), Duration::from_secs(10))
            .start(&interface(config), peer)
            .await
            .unwrap()
            .unwrap();

        // Tick at 10s stalls until the 40s deadline; the next tick runs at 50s.
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
        assert_eq!(device.blocks.lock().unwrap().len(), 1);

        // The third lookup is still pending; stopping must not wait for it.
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_is_not_retried() {
        let lookup = ScriptedLookup::new(vec![
            Ok(vec![ip("192.0.2.1")]),
            Ok(vec![ip("198.51.100.9")]),
        ]);
        let config = peer_config("vpn.example");
        let peer = Peer::resolve_with_probe(
            &config,
            || Ok(lookup.clone() as Arc<dyn Lookup>),
            open(),
        )
        .await
        .unwrap();

        let device = Arc::new(RecordingDevice::default());
        let handle = PeerManager::new(device.clone(), Duration::from_secs(10))
            .start(&interface(config), peer)
            .await
            .unwrap()
            .unwrap();
        device.fail.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(35)).await;
        // One failed update, then unchanged cycles emit nothing.
        assert_eq!(device.blocks.lock().unwrap().len(), 2);
        drop(handle);
    }
}
