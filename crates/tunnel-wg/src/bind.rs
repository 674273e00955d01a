//! Packet transport used by the tunnel engine.
//!
//! [`Bind`] is the UDP boundary a WireGuard engine sends and receives
//! encrypted messages through. [`UdpBind`] is a plain pass-through.
//! [`ClientIdBind`] wraps any bind and rewrites the three reserved bytes of
//! the WireGuard message header: outgoing packets carry the client id,
//! incoming packets have it zeroed before the engine parses them.

use crate::keys::ClientId;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Reserved header bytes, `[1..4]` of every WireGuard message.
const RESERVED: std::ops::Range<usize> = 1..4;

/// Upper bound on one blocking receive, so receive loops can notice a close
/// on platforms where shutting down a UDP socket does not wake readers.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Remote address of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(pub SocketAddr);

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Blocking receive of up to `bufs.len()` packets.
///
/// Fills `sizes[i]` and `eps[i]` for each packet received and returns the
/// packet count. A count of zero means nothing arrived before the receive
/// timeout.
pub type ReceiveFn = Box<
    dyn Fn(&mut [&mut [u8]], &mut [usize], &mut [Option<Endpoint>]) -> io::Result<usize>
        + Send
        + Sync,
>;

fn receive_fn<F>(f: F) -> ReceiveFn
where
    F: Fn(&mut [&mut [u8]], &mut [usize], &mut [Option<Endpoint>]) -> io::Result<usize>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// UDP transport for the tunnel engine.
pub trait Bind: Send + Sync {
    /// Bind to `port` (0 picks one) and return the receive functions and the
    /// port actually bound.
    fn open(&mut self, port: u16) -> io::Result<(Vec<ReceiveFn>, u16)>;

    /// Close all sockets. Blocked receive functions return.
    fn close(&mut self) -> io::Result<()>;

    /// Set the firewall mark on outgoing packets.
    fn set_mark(&self, mark: u32) -> io::Result<()>;

    /// Send every packet in `bufs` to `endpoint`.
    ///
    /// Buffers are mutable so wrappers can rewrite packets in place.
    fn send(&self, bufs: &mut [&mut [u8]], endpoint: &Endpoint) -> io::Result<()>;

    fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint>;

    /// Largest batch a receive function fills or `send` accepts at once.
    fn batch_size(&self) -> usize;
}

/// Pick the transport once: pass-through without a client id, rewriting
/// with one.
pub fn new_bind(client_id: Option<ClientId>) -> Box<dyn Bind> {
    match client_id {
        Some(id) => Box::new(ClientIdBind::new(UdpBind::new(), id)),
        None => Box::new(UdpBind::new()),
    }
}

/// Dual-stack UDP sockets, one datagram per call.
#[derive(Debug, Default)]
pub struct UdpBind {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

impl UdpBind {
    pub fn new() -> Self {
        Self::default()
    }

    fn sockets(&self) -> impl Iterator<Item = &Arc<UdpSocket>> {
        self.v4.iter().chain(self.v6.iter())
    }

    fn bind_v6(port: u16) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(true)?;
        socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(socket.into())
    }

    fn receiver(socket: Arc<UdpSocket>) -> ReceiveFn {
        receive_fn(move |bufs, sizes, eps| {
            let Some(buf) = bufs.first_mut() else {
                return Ok(0);
            };
            let (n, from) = match socket.recv_from(buf) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => return Ok(0),
                Err(e) => return Err(e),
            };
            sizes[0] = n;
            eps[0] = Some(Endpoint(from));
            Ok(1)
        })
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl Bind for UdpBind {
    fn open(&mut self, port: u16) -> io::Result<(Vec<ReceiveFn>, u16)> {
        if self.v4.is_some() || self.v6.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "bind is already open",
            ));
        }

        let v4 = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        v4.set_read_timeout(Some(RECV_TIMEOUT))?;
        let actual_port = v4.local_addr()?.port();
        let v4 = Arc::new(v4);

        let mut fns = vec![Self::receiver(v4.clone())];
        self.v4 = Some(v4);

        match Self::bind_v6(actual_port) {
            Ok(v6) => {
                let v6 = Arc::new(v6);
                fns.push(Self::receiver(v6.clone()));
                self.v6 = Some(v6);
            }
            Err(e) => log::debug!("IPv6 UDP bind on port {} unavailable: {}", actual_port, e),
        }

        log::debug!("UDP bind listening on port {}", actual_port);
        Ok((fns, actual_port))
    }

    fn close(&mut self) -> io::Result<()> {
        for socket in self.sockets() {
            // Wakes any receive function blocked on this socket.
            let _ = SockRef::from(socket.as_ref()).shutdown(Shutdown::Both);
        }
        self.v4 = None;
        self.v6 = None;
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn set_mark(&self, mark: u32) -> io::Result<()> {
        for socket in self.sockets() {
            SockRef::from(socket.as_ref()).set_mark(mark)?;
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn set_mark(&self, _mark: u32) -> io::Result<()> {
        Ok(())
    }

    fn send(&self, bufs: &mut [&mut [u8]], endpoint: &Endpoint) -> io::Result<()> {
        let socket = match endpoint.0 {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no open socket for {}", endpoint),
            )
        })?;
        for buf in bufs.iter() {
            socket.send_to(buf, endpoint.0)?;
        }
        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint> {
        s.parse::<SocketAddr>().map(Endpoint).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid endpoint '{}': {}", s, e))
        })
    }

    fn batch_size(&self) -> usize {
        1
    }
}

/// Write the client id into the reserved header bytes.
///
/// Packets of four bytes or fewer are left alone.
pub fn stamp_reserved(packet: &mut [u8], client_id: &ClientId) {
    if packet.len() > 4 {
        packet[RESERVED].copy_from_slice(client_id.as_bytes());
    }
}

/// Zero the reserved header bytes.
///
/// Packets of four bytes or fewer are left alone.
pub fn clear_reserved(packet: &mut [u8]) {
    if packet.len() > 4 {
        packet[RESERVED].fill(0);
    }
}

/// Wraps a bind and rewrites the reserved header bytes of every packet.
#[derive(Debug)]
pub struct ClientIdBind<B> {
    inner: B,
    client_id: ClientId,
}

impl<B: Bind> ClientIdBind<B> {
    pub fn new(inner: B, client_id: ClientId) -> Self {
        Self { inner, client_id }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }
}

impl<B: Bind> Bind for ClientIdBind<B> {
    fn open(&mut self, port: u16) -> io::Result<(Vec<ReceiveFn>, u16)> {
        let (fns, actual_port) = self.inner.open(port)?;
        let fns = fns
            .into_iter()
            .map(|recv| {
                receive_fn(move |bufs, sizes, eps| {
                    let n = recv(&mut *bufs, &mut *sizes, &mut *eps)?;
                    for (buf, &size) in bufs.iter_mut().zip(sizes.iter()).take(n) {
                        let size = size.min(buf.len());
                        clear_reserved(&mut buf[..size]);
                    }
                    Ok(n)
                })
            })
            .collect();
        Ok((fns, actual_port))
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        self.inner.set_mark(mark)
    }

    fn send(&self, bufs: &mut [&mut [u8]], endpoint: &Endpoint) -> io::Result<()> {
        for buf in bufs.iter_mut() {
            stamp_reserved(buf, &self.client_id);
        }
        self.inner.send(bufs, endpoint)
    }

    fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint> {
        self.inner.parse_endpoint(s)
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const ID: ClientId = ClientId::new([0xaa, 0xbb, 0xcc]);

    /// In-memory bind: records sent packets, receives queued batches.
    #[derive(Default)]
    struct MemoryBind {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        inbound: Arc<Mutex<Vec<Vec<u8>>>>,
        mark: Mutex<Option<u32>>,
    }

    impl Bind for MemoryBind {
        fn open(&mut self, port: u16) -> io::Result<(Vec<ReceiveFn>, u16)> {
            let inbound = self.inbound.clone();
            let recv = receive_fn(move |bufs, sizes, eps| {
                let mut queued = inbound.lock().unwrap();
                let n = queued.len().min(bufs.len());
                for (i, packet) in queued.drain(..n).enumerate() {
                    bufs[i][..packet.len()].copy_from_slice(&packet);
                    sizes[i] = packet.len();
                    eps[i] = Some(Endpoint("192.0.2.1:51820".parse().unwrap()));
                }
                Ok(n)
            });
            Ok((vec![recv], port))
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn set_mark(&self, mark: u32) -> io::Result<()> {
            *self.mark.lock().unwrap() = Some(mark);
            Ok(())
        }

        fn send(&self, bufs: &mut [&mut [u8]], _endpoint: &Endpoint) -> io::Result<()> {
            let mut sent = self.sent.lock().unwrap();
            sent.extend(bufs.iter().map(|b| b.to_vec()));
            Ok(())
        }

        fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint> {
            UdpBind::new().parse_endpoint(s)
        }

        fn batch_size(&self) -> usize {
            8
        }
    }

    #[test]
    fn test_stamp_and_clear_boundaries() {
        let mut short = [1u8, 2, 3, 4];
        stamp_reserved(&mut short, &ID);
        assert_eq!(short, [1, 2, 3, 4]);
        clear_reserved(&mut short);
        assert_eq!(short, [1, 2, 3, 4]);

        let mut packet = [4u8, 0, 0, 0, 9];
        stamp_reserved(&mut packet, &ID);
        assert_eq!(packet, [4, 0xaa, 0xbb, 0xcc, 9]);
        clear_reserved(&mut packet);
        assert_eq!(packet, [4, 0, 0, 0, 9]);

        let mut empty: [u8; 0] = [];
        stamp_reserved(&mut empty, &ID);
        clear_reserved(&mut empty);
    }

    #[test]
    fn test_send_rewrites_each_packet_in_batch() {
        let inner = MemoryBind::default();
        let sent = inner.sent.clone();
        let bind = ClientIdBind::new(inner, ID);

        let mut handshake = vec![1u8; 148];
        let mut tiny = vec![7u8; 3];
        let mut transport = vec![4u8; 32];
        let mut bufs: Vec<&mut [u8]> = vec![
            handshake.as_mut_slice(),
            tiny.as_mut_slice(),
            transport.as_mut_slice(),
        ];
        let endpoint = bind.parse_endpoint("192.0.2.1:51820").unwrap();
        bind.send(&mut bufs, &endpoint).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..5], &[1, 0xaa, 0xbb, 0xcc, 1]);
        assert_eq!(sent[1], vec![7, 7, 7]);
        assert_eq!(&sent[2][..4], &[4, 0xaa, 0xbb, 0xcc]);
        assert_eq!(sent[2].len(), 32);
    }

    #[test]
    fn test_receive_clears_by_received_size() {
        let inner = MemoryBind::default();
        let inbound = inner.inbound.clone();
        let mut bind = ClientIdBind::new(inner, ID);
        let (fns, port) = bind.open(51820).unwrap();
        assert_eq!(port, 51820);

        inbound.lock().unwrap().extend([
            vec![2, 0x11, 0x22, 0x33, 0x44, 0x55],
            vec![9, 9, 9, 9],
        ]);

        // Buffers are larger than the packets; a 4-byte packet must survive
        // untouched even though its buffer is longer.
        let mut a = [0xffu8; 64];
        let mut b = [0xffu8; 64];
        let mut bufs: Vec<&mut [u8]> = vec![&mut a[..], &mut b[..]];
        let mut sizes = [0usize; 2];
        let mut eps = [None; 2];
        let n = fns[0](bufs.as_mut_slice(), &mut sizes, &mut eps).unwrap();

        assert_eq!(n, 2);
        assert_eq!(sizes, [6, 4]);
        assert_eq!(&bufs[0][..6], &[2, 0, 0, 0, 0x44, 0x55]);
        assert_eq!(&bufs[1][..4], &[9, 9, 9, 9]);
        assert!(eps.iter().all(|ep| ep.is_some()));
    }

    #[test]
    fn test_decorator_delegates() {
        let mut bind = ClientIdBind::new(MemoryBind::default(), ID);
        assert_eq!(bind.batch_size(), 8);
        bind.set_mark(0x51820).unwrap();
        assert_eq!(*bind.inner.mark.lock().unwrap(), Some(0x51820));
        assert!(bind.parse_endpoint("not an endpoint").is_err());
        bind.close().unwrap();
        assert_eq!(bind.client_id(), &ID);
    }

    #[test]
    fn test_udp_bind_loopback_with_client_id() {
        let mut bind = new_bind(Some(ID));
        let (fns, port) = bind.open(0).unwrap();
        assert_ne!(port, 0);
        assert_eq!(bind.batch_size(), 1);

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let remote_ep = Endpoint(remote.local_addr().unwrap());

        // Outbound: the peer sees the client id.
        let mut packet = vec![1u8, 0, 0, 0, 0xde, 0xad];
        let mut bufs: Vec<&mut [u8]> = vec![packet.as_mut_slice()];
        bind.send(&mut bufs, &remote_ep).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 0xaa, 0xbb, 0xcc, 0xde, 0xad]);
        assert_eq!(from.port(), port);

        // Inbound: the engine sees zeroed reserved bytes.
        remote
            .send_to(&[2, 0x01, 0x02, 0x03, 0xbe, 0xef], ("127.0.0.1", port))
            .unwrap();
        let mut rx = [0u8; 64];
        let mut bufs: Vec<&mut [u8]> = vec![&mut rx[..]];
        let mut sizes = [0usize; 1];
        let mut eps = [None; 1];
        let count = fns[0](bufs.as_mut_slice(), &mut sizes, &mut eps).unwrap();
        assert_eq!(count, 1);
        assert_eq!(&bufs[0][..sizes[0]], &[2, 0, 0, 0, 0xbe, 0xef]);
        assert_eq!(eps[0].map(|ep| ep.0.port()), Some(remote_ep.0.port()));

        bind.close().unwrap();
    }

    #[test]
    fn test_idle_receive_returns_zero() {
        let mut bind = UdpBind::new();
        let (fns, _port) = bind.open(0).unwrap();
        let mut rx = [0u8; 64];
        let mut bufs: Vec<&mut [u8]> = vec![&mut rx[..]];
        let mut sizes = [0usize; 1];
        let mut eps = [None; 1];
        assert_eq!(fns[0](bufs.as_mut_slice(), &mut sizes, &mut eps).unwrap(), 0);
        assert!(eps[0].is_none());
        bind.close().unwrap();
    }

    #[test]
    fn test_udp_bind_passthrough() {
        let mut bind = new_bind(None);
        let (_fns, _port) = bind.open(0).unwrap();
        assert!(bind.open(0).is_err());

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut packet = vec![1u8, 5, 6, 7, 8];
        let mut bufs: Vec<&mut [u8]> = vec![packet.as_mut_slice()];
        bind.send(&mut bufs, &Endpoint(remote.local_addr().unwrap()))
            .unwrap();
        let mut buf = [0u8; 16];
        let n = remote.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 5, 6, 7, 8]);

        bind.close().unwrap();
        assert!(bind
            .send(&mut bufs, &Endpoint(remote.local_addr().unwrap()))
            .is_err());
    }
}
