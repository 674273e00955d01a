//! Injectable byte-stream dialing.
//!
//! Every socket connect made by the resolver goes through a [`Dial`]
//! implementation, so a caller can route DNS traffic through the tunnel (or
//! anything else) by swapping the dialer. [`DirectDialer`] is the host-network
//! default.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};

/// Transport requested from a dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Bidirectional byte stream returned by a dialer.
///
/// For [`Network::Udp`] each `write` is one datagram and each `read` returns
/// at most one datagram.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed dialed stream.
pub type BoxStream = Box<dyn AsyncStream>;

/// Dial function shared by the resolver, the DoH client and the proxy layer.
///
/// Implementations may be called concurrently from unrelated tasks.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Connect to `address` (`host:port`) over `network`.
    async fn dial(&self, network: Network, address: &str) -> io::Result<BoxStream>;
}

/// Dialer using the host network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dial for DirectDialer {
    async fn dial(&self, network: Network, address: &str) -> io::Result<BoxStream> {
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Network::Udp => Ok(Box::new(UdpStream::connect(address).await?)),
        }
    }
}

/// A connected UDP socket exposed as a stream, one datagram per read/write.
#[derive(Debug)]
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    /// Bind an ephemeral local socket and connect it to `address`.
    ///
    /// Each resolved address is tried in turn; the last error is returned if
    /// none of them can be connected.
    pub async fn connect(address: &str) -> io::Result<Self> {
        let mut last_err = None;
        for addr in lookup_host(address).await? {
            match Self::connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses for {}", address),
            )
        }))
    }

    async fn connect_addr(addr: SocketAddr) -> io::Result<Self> {
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(Self { socket })
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
