//! In-process WireGuard engine using boringtun.
//!
//! [`EngineDevice`] drives boringtun's `Tunn` over a [`Bind`], so every
//! handshake and transport message passes through the bind chosen at
//! startup (including [`ClientIdBind`](crate::bind::ClientIdBind)). It is
//! configured with the same text blocks as an external device and hands
//! decrypted IP packets to the user-space network stack through
//! [`TunnelPackets`].
//!
//! One peer is supported. Its allowed IPs are always everything, so
//! `allowed_ip` lines are accepted and ignored.

use crate::bind::{Bind, Endpoint, ReceiveFn};
use crate::device::TunnelDevice;
use crate::error::{WgError, WgResult};
use crate::keys::WgKey;
use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use std::fmt::{self, Write as _};
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Buffer size for one WireGuard message.
pub const WG_BUFFER_SIZE: usize = 2048;

/// How often boringtun timers are driven (handshake retries, keepalives).
pub const TIMER_INTERVAL: Duration = Duration::from_millis(100);

/// Decrypted packets waiting for the network stack.
const INBOUND_QUEUE: usize = 256;

/// Pause after a failed receive before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(50);

static NEXT_INDEX: AtomicU32 = AtomicU32::new(1);

/// Peer section of a configuration block.
#[derive(Debug)]
struct PeerBlock {
    public_key: WgKey,
    update_only: bool,
    endpoint: Option<Endpoint>,
    keepalive: Option<u16>,
    preshared_key: Option<WgKey>,
}

/// A parsed configuration block. Nothing is applied until the whole block
/// parses.
#[derive(Debug, Default)]
struct Block {
    private_key: Option<WgKey>,
    listen_port: Option<u16>,
    fwmark: Option<u32>,
    peer: Option<PeerBlock>,
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> WgResult<T> {
    value
        .parse()
        .map_err(|_| WgError::Config(format!("invalid {} '{}'", key, value)))
}

fn parse_block(text: &str, bind: &dyn Bind) -> WgResult<Block> {
    let mut block = Block::default();
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| WgError::Config(format!("malformed line '{}'", line)))?;
        match key {
            "private_key" => block.private_key = Some(WgKey::from_hex(value)?),
            "listen_port" => block.listen_port = Some(parse_value(key, value)?),
            "fwmark" => block.fwmark = Some(parse_value(key, value)?),
            "replace_peers" => {}
            "public_key" => {
                if block.peer.is_some() {
                    return Err(WgError::Config("only one peer is supported".into()));
                }
                block.peer = Some(PeerBlock {
                    public_key: WgKey::from_hex(value)?,
                    update_only: false,
                    endpoint: None,
                    keepalive: None,
                    preshared_key: None,
                });
            }
            _ => {
                let peer = block
                    .peer
                    .as_mut()
                    .ok_or_else(|| WgError::Config(format!("'{}' before public_key", key)))?;
                match key {
                    "update_only" => peer.update_only = parse_value(key, value)?,
                    "endpoint" => {
                        let endpoint = bind
                            .parse_endpoint(value)
                            .map_err(|e| WgError::Config(e.to_string()))?;
                        peer.endpoint = Some(endpoint);
                    }
                    "persistent_keepalive_interval" => {
                        peer.keepalive = Some(parse_value(key, value)?)
                    }
                    "preshared_key" => peer.preshared_key = Some(WgKey::from_hex(value)?),
                    "allowed_ip" | "replace_allowed_ips" | "protocol_version" => {}
                    _ => return Err(WgError::Config(format!("unsupported key '{}'", key))),
                }
            }
        }
    }
    Ok(block)
}

fn new_tunn(
    private_key: &WgKey,
    public_key: &WgKey,
    preshared_key: Option<WgKey>,
    keepalive: Option<u16>,
) -> Tunn {
    Tunn::new(
        StaticSecret::from(*private_key.as_bytes()),
        PublicKey::from(*public_key.as_bytes()),
        preshared_key.map(|psk| *psk.as_bytes()),
        keepalive,
        NEXT_INDEX.fetch_add(1, Ordering::Relaxed),
        None,
    )
    .expect("boringtun 0.6 Tunn::new is infallible")
}

struct PeerState {
    public_key: WgKey,
    preshared_key: Option<WgKey>,
    keepalive: Option<u16>,
    endpoint: Option<Endpoint>,
    tunn: Tunn,
    buf: Vec<u8>,
}

impl PeerState {
    /// Apply a peer section on top of the previous state of the same peer.
    ///
    /// The noise session survives unless a key or the keepalive changed.
    fn merge(
        previous: Option<PeerState>,
        update: PeerBlock,
        private_key: &WgKey,
        rekey: bool,
    ) -> PeerState {
        let keepalive = |old: Option<u16>| match update.keepalive {
            Some(0) => None,
            Some(secs) => Some(secs),
            None => old,
        };
        match previous {
            Some(mut peer) => {
                let keepalive = keepalive(peer.keepalive);
                let preshared_key = update.preshared_key.or(peer.preshared_key);
                if rekey || keepalive != peer.keepalive || preshared_key != peer.preshared_key {
                    peer.tunn = new_tunn(private_key, &peer.public_key, preshared_key, keepalive);
                }
                peer.keepalive = keepalive;
                peer.preshared_key = preshared_key;
                if update.endpoint.is_some() {
                    peer.endpoint = update.endpoint;
                }
                peer
            }
            None => {
                let keepalive = keepalive(None);
                PeerState {
                    public_key: update.public_key,
                    preshared_key: update.preshared_key,
                    keepalive,
                    endpoint: update.endpoint,
                    tunn: new_tunn(
                        private_key,
                        &update.public_key,
                        update.preshared_key,
                        keepalive,
                    ),
                    buf: vec![0u8; WG_BUFFER_SIZE],
                }
            }
        }
    }
}

struct Interface {
    private_key: WgKey,
    listen_port: u16,
    fwmark: Option<u32>,
    peer: Option<PeerState>,
}

impl Interface {
    fn render(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "private_key={}", self.private_key)?;
        writeln!(out, "listen_port={}", self.listen_port)?;
        if let Some(mark) = self.fwmark {
            writeln!(out, "fwmark={}", mark)?;
        }
        let Some(peer) = &self.peer else {
            return Ok(());
        };
        writeln!(out, "public_key={}", peer.public_key)?;
        if let Some(psk) = &peer.preshared_key {
            writeln!(out, "preshared_key={}", psk)?;
        }
        if let Some(endpoint) = &peer.endpoint {
            writeln!(out, "endpoint={}", endpoint)?;
        }
        let (since_handshake, tx_bytes, rx_bytes, _loss, _rtt) = peer.tunn.stats();
        let handshake = since_handshake
            .and_then(|elapsed| SystemTime::now().checked_sub(elapsed))
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        writeln!(out, "last_handshake_time_sec={}", handshake.as_secs())?;
        writeln!(out, "last_handshake_time_nsec={}", handshake.subsec_nanos())?;
        writeln!(out, "rx_bytes={}", rx_bytes)?;
        writeln!(out, "tx_bytes={}", tx_bytes)?;
        writeln!(
            out,
            "persistent_keepalive_interval={}",
            peer.keepalive.unwrap_or(0)
        )?;
        writeln!(out, "allowed_ip=0.0.0.0/0")?;
        writeln!(out, "allowed_ip=::/0")
    }
}

/// Destination address of an IPv4 or IPv6 packet.
fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 => {
            let octets: [u8; 16] = packet.get(24..40)?.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn send_packet(bind: &dyn Bind, packet: &mut [u8], endpoint: &Endpoint) -> io::Result<()> {
    bind.send(&mut [packet], endpoint)
}

/// State shared by the device handle, the packet handle, receive threads and
/// the timer task. Locks are always taken state first, then bind.
struct Shared {
    bind: RwLock<Box<dyn Bind>>,
    state: Mutex<Option<Interface>>,
    addresses: Vec<IpAddr>,
    mtu: u16,
    inbound: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, Option<Interface>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_bind(&self) -> RwLockReadGuard<'_, Box<dyn Bind>> {
        self.bind.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_bind(&self) -> RwLockWriteGuard<'_, Box<dyn Bind>> {
        self.bind.write().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn apply(self: &Arc<Self>, block: Block) -> WgResult<()> {
        if self.is_closed() {
            return Err(WgError::Device("engine is closed".into()));
        }
        let mut state = self.lock_state();

        let private_key = match (block.private_key, state.as_ref()) {
            (Some(key), _) => key,
            (None, Some(iface)) => iface.private_key,
            (None, None) => {
                return Err(WgError::Config(
                    "private_key is required in the first block".into(),
                ))
            }
        };
        if let Some(update) = block.peer.as_ref().filter(|peer| peer.update_only) {
            let known = state
                .as_ref()
                .and_then(|iface| iface.peer.as_ref())
                .is_some_and(|peer| peer.public_key == update.public_key);
            if !known {
                return Err(WgError::Config(format!(
                    "update for unknown peer {}",
                    update.public_key
                )));
            }
        }

        let iface = match state.as_mut() {
            Some(iface) => {
                if let Some(port) = block.listen_port.filter(|&port| port != 0) {
                    if port != iface.listen_port {
                        return Err(WgError::Config(format!(
                            "listen port is fixed at {}",
                            iface.listen_port
                        )));
                    }
                }
                if let Some(mark) = block.fwmark {
                    self.read_bind().set_mark(mark)?;
                    iface.fwmark = Some(mark);
                }
                iface
            }
            None => {
                let listen_port = self.open(block.listen_port.unwrap_or(0), block.fwmark)?;
                log::info!(
                    "WireGuard engine listening on port {} (public key {})",
                    listen_port,
                    private_key.public_key().to_base64()
                );
                state.insert(Interface {
                    private_key,
                    listen_port,
                    fwmark: block.fwmark,
                    peer: None,
                })
            }
        };

        let rekey = iface.private_key != private_key;
        iface.private_key = private_key;
        match block.peer {
            Some(update) => {
                let previous = iface
                    .peer
                    .take()
                    .filter(|peer| peer.public_key == update.public_key);
                let peer = PeerState::merge(previous, update, &private_key, rekey);
                if let Some(endpoint) = &peer.endpoint {
                    log::debug!("WireGuard peer endpoint {}", endpoint);
                }
                iface.peer = Some(peer);
            }
            None if rekey => {
                if let Some(peer) = iface.peer.as_mut() {
                    peer.tunn = new_tunn(
                        &private_key,
                        &peer.public_key,
                        peer.preshared_key,
                        peer.keepalive,
                    );
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Open the bind and start the receive threads and the timer task.
    fn open(self: &Arc<Self>, port: u16, fwmark: Option<u32>) -> WgResult<u16> {
        let mut bind = self.write_bind();
        let (fns, listen_port) = bind.open(port)?;
        if let Some(mark) = fwmark {
            if let Err(e) = bind.set_mark(mark) {
                let _ = bind.close();
                return Err(e.into());
            }
        }
        if let Err(e) = self.spawn_receivers(fns, bind.batch_size()) {
            // Threads already started only stop once the engine is closed.
            self.closed.store(true, Ordering::Release);
            let _ = bind.close();
            return Err(e);
        }
        drop(bind);
        self.spawn_timers();
        Ok(listen_port)
    }

    fn spawn_receivers(self: &Arc<Self>, fns: Vec<ReceiveFn>, batch: usize) -> WgResult<()> {
        for (i, recv) in fns.into_iter().enumerate() {
            let shared = Arc::clone(self);
            std::thread::Builder::new()
                .name(format!("wg-recv-{}", i))
                .spawn(move || shared.receive_loop(recv, batch))?;
        }
        Ok(())
    }

    fn spawn_timers(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIMER_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.update_timers(),
                    _ = shutdown_rx.changed() => break,
                }
            }
            log::debug!("WireGuard timers stopped");
        });
    }

    fn receive_loop(&self, recv: ReceiveFn, batch: usize) {
        let batch = batch.max(1);
        let mut storage = vec![vec![0u8; WG_BUFFER_SIZE]; batch];
        let mut sizes = vec![0usize; batch];
        let mut eps: Vec<Option<Endpoint>> = vec![None; batch];

        while !self.is_closed() {
            let mut bufs: Vec<&mut [u8]> = storage.iter_mut().map(Vec::as_mut_slice).collect();
            let count = match recv(
                bufs.as_mut_slice(),
                sizes.as_mut_slice(),
                eps.as_mut_slice(),
            ) {
                Ok(count) => count,
                Err(e) => {
                    if !self.is_closed() {
                        log::debug!("WireGuard receive failed: {}", e);
                        std::thread::sleep(RECV_BACKOFF);
                    }
                    continue;
                }
            };
            let received = bufs.iter().zip(&sizes).zip(eps.iter_mut()).take(count);
            for ((buf, &size), ep) in received {
                if let Some(from) = ep.take() {
                    self.handle_datagram(&buf[..size.min(buf.len())], from);
                }
            }
        }
        log::debug!("WireGuard receive loop stopped");
    }

    fn handle_datagram(&self, datagram: &[u8], from: Endpoint) {
        if datagram.is_empty() {
            return;
        }
        let mut state = self.lock_state();
        let Some(peer) = state.as_mut().and_then(|iface| iface.peer.as_mut()) else {
            return;
        };
        let bind = self.read_bind();
        let PeerState {
            tunn,
            buf,
            endpoint,
            ..
        } = peer;

        let flush = match tunn.decapsulate(Some(from.0.ip()), datagram, buf) {
            TunnResult::Done => false,
            TunnResult::WriteToNetwork(packet) => {
                if let Err(e) = send_packet(&**bind, packet, &from) {
                    log::debug!("Send to {}: {}", from, e);
                }
                true
            }
            TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                self.deliver(packet);
                false
            }
            TunnResult::Err(e) => {
                log::debug!("Dropped packet from {}: {:?}", from, e);
                return;
            }
        };

        if *endpoint != Some(from) {
            log::debug!("WireGuard peer roamed to {}", from);
            *endpoint = Some(from);
        }
        if flush {
            // Packets queued while the handshake was in flight.
            while let TunnResult::WriteToNetwork(packet) = tunn.decapsulate(None, &[], buf) {
                if let Err(e) = send_packet(&**bind, packet, &from) {
                    log::debug!("Send to {}: {}", from, e);
                }
            }
        }
    }

    fn deliver(&self, packet: &[u8]) {
        match destination(packet) {
            Some(dst) if self.addresses.is_empty() || self.addresses.contains(&dst) => {}
            dst => {
                log::debug!("Dropped tunnel packet for {:?}", dst);
                return;
            }
        }
        if let Err(e) = self.inbound.try_send(packet.to_vec()) {
            log::debug!("Dropped tunnel packet: {}", e);
        }
    }

    fn encapsulate(&self, packet: &[u8]) -> WgResult<()> {
        let mut state = self.lock_state();
        let peer = state
            .as_mut()
            .and_then(|iface| iface.peer.as_mut())
            .ok_or_else(|| WgError::Device("no peer configured".into()))?;
        let endpoint = peer
            .endpoint
            .ok_or_else(|| WgError::Device("peer has no endpoint".into()))?;
        let bind = self.read_bind();
        match peer.tunn.encapsulate(packet, &mut peer.buf) {
            TunnResult::WriteToNetwork(data) => send_packet(&**bind, data, &endpoint)?,
            TunnResult::Err(e) => {
                return Err(WgError::Device(format!("encapsulate: {:?}", e)));
            }
            _ => {}
        }
        Ok(())
    }

    fn update_timers(&self) {
        let mut state = self.lock_state();
        let Some(peer) = state.as_mut().and_then(|iface| iface.peer.as_mut()) else {
            return;
        };
        let bind = self.read_bind();
        match peer.tunn.update_timers(&mut peer.buf) {
            TunnResult::WriteToNetwork(packet) => {
                if let Some(endpoint) = &peer.endpoint {
                    if let Err(e) = send_packet(&**bind, packet, endpoint) {
                        log::debug!("Send to {}: {}", endpoint, e);
                    }
                }
            }
            TunnResult::Err(e) => log::trace!("WireGuard timers: {:?}", e),
            _ => {}
        }
    }
}

/// WireGuard device running in this process.
pub struct EngineDevice {
    shared: Arc<Shared>,
}

impl EngineDevice {
    /// Create an unconfigured engine over `bind`.
    ///
    /// `addresses` are the tunnel addresses of this host; decrypted packets
    /// for any other destination are dropped. The bind is opened by the
    /// first configuration block.
    pub fn new(bind: Box<dyn Bind>, addresses: Vec<IpAddr>, mtu: u16) -> (Self, TunnelPackets) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            bind: RwLock::new(bind),
            state: Mutex::new(None),
            addresses,
            mtu,
            inbound: inbound_tx,
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        let packets = TunnelPackets {
            shared: shared.clone(),
            inbound: inbound_rx,
            shutdown_rx,
        };
        (Self { shared }, packets)
    }

    /// UDP port the engine listens on, once configured.
    pub fn listen_port(&self) -> Option<u16> {
        self.shared
            .lock_state()
            .as_ref()
            .map(|iface| iface.listen_port)
    }

    /// Stop the timers and receive threads and close the bind.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown_tx.send(true);
        if let Err(e) = self.shared.write_bind().close() {
            log::debug!("Close WireGuard bind: {}", e);
        }
        log::debug!("WireGuard engine closed");
    }
}

impl Drop for EngineDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl TunnelDevice for EngineDevice {
    async fn ipc_set(&self, block: &str) -> WgResult<()> {
        let parsed = parse_block(block, &**self.shared.read_bind())?;
        self.shared.apply(parsed)
    }

    async fn ipc_get(&self) -> WgResult<String> {
        let mut out = String::new();
        if let Some(iface) = self.shared.lock_state().as_ref() {
            iface
                .render(&mut out)
                .map_err(|e| WgError::Device(e.to_string()))?;
        }
        Ok(out)
    }
}

/// IP packet boundary of the engine, owned by the user-space network stack.
pub struct TunnelPackets {
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Vec<u8>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelPackets {
    /// Next decrypted packet addressed to this host. `None` once the engine
    /// is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if self.shared.is_closed() {
            return None;
        }
        tokio::select! {
            packet = self.inbound.recv() => packet,
            _ = self.shutdown_rx.changed() => None,
        }
    }

    /// Encrypt `packet` and send it to the peer.
    ///
    /// Before the first handshake the packet is queued and a handshake
    /// initiation goes out instead.
    pub fn send(&self, packet: &[u8]) -> WgResult<()> {
        if self.shared.is_closed() {
            return Err(WgError::Device("engine is closed".into()));
        }
        if packet.len() > usize::from(self.shared.mtu) {
            return Err(WgError::Config(format!(
                "packet of {} bytes exceeds MTU {}",
                packet.len(),
                self.shared.mtu
            )));
        }
        self.shared.encapsulate(packet)
    }

    pub fn mtu(&self) -> u16 {
        self.shared.mtu
    }

    /// Tunnel addresses of this host.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.shared.addresses
    }
}
