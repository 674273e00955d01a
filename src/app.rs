//! Process startup and shutdown.

use crate::config::{ExitMode, Options};
use crate::proxy::{ProxyBoundary, STATS_PATH};
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tunnel_dns::{ensure_crypto_provider, Dial, DirectDialer, Lookup, Resolver, ResolverConfig};
use tunnel_wg::{
    new_bind, EngineDevice, InterfaceConfig, Peer, PeerManager, RefreshHandle, TunnelDevice,
    TunnelPackets, UapiDevice, WgError,
};

/// Deadline for resolving the peer endpoint at startup.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// What the user-space network stack needs to serve the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub client_ips: Vec<IpAddr>,
    pub mtu: u16,
    pub listen: String,
    pub exit_mode: ExitMode,
}

/// A configured tunnel with its peer endpoint kept current.
pub struct Bridge {
    network: NetworkConfig,
    dns: ResolverConfig,
    device: Arc<dyn TunnelDevice>,
    engine: Option<Arc<EngineDevice>>,
    packets: Option<TunnelPackets>,
    refresh: Option<RefreshHandle>,
}

impl Bridge {
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// IP packet boundary of the in-process engine.
    ///
    /// `None` with an external device, or once taken.
    pub fn take_packets(&mut self) -> Option<TunnelPackets> {
        self.packets.take()
    }

    /// Proxy boundary that connects over `dial` and resolves client
    /// hostnames with the `--dns` resolver.
    pub fn proxy(&self, dial: Arc<dyn Dial>) -> Result<ProxyBoundary> {
        ProxyBoundary::new(self.dns.clone(), dial, self.device.clone())
    }

    /// Stop the endpoint refresh and close the engine.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.refresh.take() {
            handle.stop().await;
        }
        if let Some(engine) = self.engine.take() {
            engine.close();
        }
        log::info!("Tunnel stopped");
    }
}

/// Bring up the device, submit the peer and start refreshing its endpoint.
///
/// Without `--uapi-socket` the in-process engine is used, over a packet
/// binding that stamps `--client-id` when one is set.
pub async fn start(options: Options) -> Result<Bridge> {
    ensure_crypto_provider();
    let interface = options.interface_config();

    let (device, engine, packets) = match &options.uapi_socket {
        Some(path) => {
            log::info!("Configuring external tunnel device at {}", path.display());
            let device: Arc<dyn TunnelDevice> = Arc::new(UapiDevice::new(path));
            (device, None, None)
        }
        None => {
            let bind = new_bind(interface.client_id);
            let (engine, packets) =
                EngineDevice::new(bind, options.client_ips.clone(), options.mtu);
            let engine = Arc::new(engine);
            (engine.clone() as Arc<dyn TunnelDevice>, Some(engine), Some(packets))
        }
    };

    let refresh = configure_peer(&interface, device.clone(), Arc::new(DirectDialer)).await?;

    Ok(Bridge {
        network: NetworkConfig {
            client_ips: options.client_ips,
            mtu: options.mtu,
            listen: options.listen,
            exit_mode: options.exit_mode,
        },
        dns: options.dns,
        device,
        engine,
        packets,
        refresh,
    })
}

/// Start the bridge and serve the proxy boundary until Ctrl+C.
pub async fn run(options: Options) -> Result<()> {
    let bridge = start(options).await?;
    let proxy = bridge.proxy(Arc::new(DirectDialer))?;

    let network = bridge.network();
    let client_ips: Vec<String> = network.client_ips.iter().map(|ip| ip.to_string()).collect();
    log::info!(
        "Proxy boundary ready: listen={} exit-mode={} client-ip={} mtu={}",
        network.listen,
        network.exit_mode,
        client_ips.join(","),
        network.mtu
    );
    if network.exit_mode == ExitMode::Local {
        log::info!("Local exit mode: peers reach {} through the tunnel", network.listen);
    }
    match proxy.stats_json().await {
        Ok(body) => log::debug!("{} {}", STATS_PATH, body.trim_end()),
        Err(e) => log::warn!("{:#}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    log::info!("Shutting down");

    bridge.shutdown().await;
    Ok(())
}

/// Resolve the peer, submit the full configuration and start refreshing.
async fn configure_peer(
    interface: &InterfaceConfig,
    device: Arc<dyn TunnelDevice>,
    dial: Arc<dyn Dial>,
) -> Result<Option<RefreshHandle>> {
    let resolve_dns = interface.resolve_dns.clone();

    let peer = tokio::time::timeout(
        STARTUP_TIMEOUT,
        Peer::resolve(&interface.peer, move || {
            let resolver = Resolver::new(resolve_dns, dial).map_err(WgError::from)?;
            Ok(Arc::new(resolver) as Arc<dyn Lookup>)
        }),
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "Timed out resolving peer endpoint {} after {:?}",
            interface.peer.endpoint,
            STARTUP_TIMEOUT
        )
    })?
    .with_context(|| format!("Failed to resolve peer endpoint {}", interface.peer.endpoint))?;

    PeerManager::new(device, interface.resolve_interval)
        .start(interface, peer)
        .await
        .context("Failed to configure tunnel device")
}

/// Print the device stats snapshot as JSON.
pub async fn print_stats(uapi_socket: &Path) -> Result<()> {
    let device: Arc<dyn TunnelDevice> = Arc::new(UapiDevice::new(uapi_socket));
    let stats = tunnel_wg::stats::snapshot(device.as_ref())
        .await
        .with_context(|| format!("Failed to read stats from {}", uapi_socket.display()))?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UdpSocket, UnixListener};
    use tunnel_wg::{ClientId, WgResult};

    #[derive(Default)]
    struct RecordingDevice {
        blocks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TunnelDevice for RecordingDevice {
        async fn ipc_set(&self, block: &str) -> WgResult<()> {
            self.blocks.lock().unwrap().push(block.to_string());
            Ok(())
        }

        async fn ipc_get(&self) -> WgResult<String> {
            Ok(String::new())
        }
    }

    fn options(endpoint: &str) -> Options {
        Settings {
            client_ip: vec!["10.0.0.2".parse().unwrap()],
            private_key: Some("dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo=".into()),
            peer_endpoint: Some(endpoint.into()),
            peer_key: Some("hSDwCYkwp1R0i33ctD73Wg2/Og0mOBr066SpjqqbTmo=".into()),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    /// Minimal IPv4 header from the tunnel address.
    fn ipv4_packet() -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[3] = 20;
        packet[8] = 64;
        packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 1]);
        packet
    }

    /// First handshake message the bridge sends to `peer`.
    async fn first_message(bridge: &mut Bridge, peer: &UdpSocket) -> Vec<u8> {
        let packets = bridge.take_packets().unwrap();
        packets.send(&ipv4_packet()).unwrap();
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_literal_endpoint_configures_without_refresh() {
        let device = Arc::new(RecordingDevice::default());
        let options = options("192.0.2.1:51820");
        let interface = options.interface_config();
        let refresh = configure_peer(&interface, device.clone(), Arc::new(DirectDialer))
            .await
            .unwrap();
        assert!(refresh.is_none());

        let blocks = device.blocks.lock().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("endpoint=192.0.2.1:51820\n"));
        assert!(blocks[0].contains("allowed_ip=0.0.0.0/0\n"));
        assert!(!blocks[0].contains("update_only"));
    }

    #[tokio::test]
    async fn test_start_stamps_client_id() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = peer.local_addr().unwrap().to_string();
        let mut options = options(&endpoint);
        options.client_id = Some(ClientId::new([1, 2, 3]));

        let mut bridge = start(options).await.unwrap();
        assert_eq!(bridge.network().mtu, 1280);
        assert_eq!(bridge.network().client_ips, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);

        let message = first_message(&mut bridge, &peer).await;
        assert_eq!(message.len(), 148);
        assert_eq!(&message[..4], &[1, 1, 2, 3]);
        assert!(bridge.take_packets().is_none());

        let stats = bridge
            .proxy(Arc::new(DirectDialer))
            .unwrap()
            .stats()
            .await
            .unwrap();
        assert_eq!(stats.endpoint, endpoint);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_client_id_keeps_reserved_zero() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut bridge = start(options(&peer.local_addr().unwrap().to_string()))
            .await
            .unwrap();

        let message = first_message(&mut bridge, &peer).await;
        assert_eq!(&message[..4], &[1, 0, 0, 0]);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_with_external_device() {
        let path: PathBuf = std::env::temp_dir().join(format!(
            "tunnel-http-app-{}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut request = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 || line == "\n" {
                    break;
                }
                request.push_str(&line);
            }
            write.write_all(b"errno=0\n\n").await.unwrap();
            let _ = seen_tx.send(request);
        });

        let mut options = options("192.0.2.1:51820");
        options.uapi_socket = Some(path.clone());
        let mut bridge = start(options).await.unwrap();
        assert!(bridge.take_packets().is_none());

        let request = seen_rx.await.unwrap();
        assert!(request.starts_with("set=1\nprivate_key="));
        assert!(request.contains("endpoint=192.0.2.1:51820\n"));
        bridge.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }
}
