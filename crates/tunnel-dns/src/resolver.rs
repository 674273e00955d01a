//! Multi-transport resolver.
//!
//! A [`Resolver`] answers A/AAAA lookups through one configured upstream.
//! The lookup engine walks the host's nameserver list like a stub resolver
//! would, but every dial is routed through a per-lookup [`PinnedDial`]: the
//! first nameserver address the engine asks for is recorded, and the actual
//! connection always goes to the configured upstream. A later attempt at a
//! different nameserver in the same lookup fails with
//! [`DnsError::NotRetry`], which ends the walk instead of silently fanning
//! the query out to a second server.

use crate::config::ResolverConfig;
use crate::dial::{BoxStream, Dial, Network};
use crate::doh::{DohClient, DohStream};
use crate::error::{DnsError, DnsResult};
use crate::tls;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use rustls::ClientConfig;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Path of the host resolver configuration.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Largest DNS message accepted over any transport.
const MAX_MESSAGE: usize = u16::MAX as usize;

/// Deadline for one query exchange with one nameserver.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Passes over the nameserver list before a query gives up.
const QUERY_ATTEMPTS: usize = 2;

/// Anything that can turn a host name into addresses.
///
/// Implemented by [`Resolver`]; consumers take `Arc<dyn Lookup>` so tests can
/// substitute a fake.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Resolve `host` to its addresses, IPv4 first.
    async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>>;
}

#[derive(Clone)]
enum Transport {
    System,
    Udp(String),
    Tcp(String),
    Tls {
        addr: String,
        server_name: String,
        config: Arc<ClientConfig>,
    },
    Https(DohClient),
}

/// DNS resolver bound to one upstream transport.
///
/// Holds no cache and no mutable state, so a single instance may serve
/// concurrent lookups.
#[derive(Clone)]
pub struct Resolver {
    config: ResolverConfig,
    transport: Transport,
    dial: Arc<dyn Dial>,
    nameservers: Option<Arc<Vec<SocketAddr>>>,
    query_timeout: Duration,
}

impl Resolver {
    /// Build a resolver. Performs no I/O.
    pub fn new(config: ResolverConfig, dial: Arc<dyn Dial>) -> DnsResult<Self> {
        let transport = match &config {
            ResolverConfig::System => Transport::System,
            ResolverConfig::Udp(addr) => Transport::Udp(addr.to_string()),
            ResolverConfig::Tcp(addr) => Transport::Tcp(addr.to_string()),
            ResolverConfig::Tls { addr, server_name } => Transport::Tls {
                addr: addr.to_string(),
                server_name: server_name.clone(),
                config: tls::client_config(&[]),
            },
            ResolverConfig::Https(url) => {
                Transport::Https(DohClient::new(url.clone(), dial.clone())?)
            }
        };
        log::debug!("DNS resolver configured: {}", config);
        Ok(Self {
            config,
            transport,
            dial,
            nameservers: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    /// Parse `dns` and build a resolver from it.
    pub fn from_dns(dns: &str, dial: Arc<dyn Dial>) -> DnsResult<Self> {
        Self::new(ResolverConfig::parse(dns)?, dial)
    }

    /// Use a fixed nameserver list instead of reading [`RESOLV_CONF`].
    pub fn with_nameservers(mut self, nameservers: Vec<SocketAddr>) -> Self {
        self.nameservers = Some(Arc::new(nameservers));
        self
    }

    /// Deadline for each query exchange (default 5s).
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// TLS server name verified for a `tls://` upstream.
    pub fn tls_server_name(&self) -> Option<&str> {
        match &self.transport {
            Transport::Tls { server_name, .. } => Some(server_name),
            _ => None,
        }
    }

    /// Resolve `host` to its addresses.
    ///
    /// IP literals are returned as-is. Otherwise A and AAAA answers are
    /// combined with IPv4 first and duplicates removed.
    pub async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Transport::System = self.transport {
            return self.lookup_system(host).await;
        }

        let mut name = Name::from_ascii(host)?;
        name.set_fqdn(true);
        let nameservers = match &self.nameservers {
            Some(list) => list.clone(),
            None => Arc::new(system_nameservers().await),
        };

        let mut pinned = PinnedDial::new(self);
        let v4 = self.query(&mut pinned, &nameservers, &name, RecordType::A).await;
        if let Err(e) = &v4 {
            if !e.is_retryable() {
                return v4;
            }
        }
        let v6 = self.query(&mut pinned, &nameservers, &name, RecordType::AAAA).await;

        let ips = match (v4, v6) {
            (Ok(mut a), Ok(aaaa)) => {
                a.extend(aaaa);
                a
            }
            (Ok(a), Err(e)) => {
                log::debug!("AAAA lookup for {} failed: {}", host, e);
                a
            }
            (Err(e), Ok(aaaa)) => {
                log::debug!("A lookup for {} failed: {}", host, e);
                aaaa
            }
            (Err(e), Err(_)) => return Err(e),
        };

        let ips = order_addrs(ips);
        if ips.is_empty() {
            return Err(DnsError::NoAddresses(host.to_string()));
        }
        log::debug!("{} resolved via {} to {:?}", host, self.config.transport_name(), ips);
        Ok(ips)
    }

    async fn lookup_system(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        let ips: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();
        let ips = order_addrs(ips);
        if ips.is_empty() {
            return Err(DnsError::NoAddresses(host.to_string()));
        }
        Ok(ips)
    }

    /// Ask each nameserver in turn until one answers, making up to
    /// [`QUERY_ATTEMPTS`] passes over the list.
    async fn query(
        &self,
        pinned: &mut PinnedDial<'_>,
        nameservers: &[SocketAddr],
        name: &Name,
        rtype: RecordType,
    ) -> DnsResult<Vec<IpAddr>> {
        let mut last_err = None;
        for _ in 0..QUERY_ATTEMPTS {
            for ns in nameservers {
                match self.query_server(pinned, &ns.to_string(), name, rtype).await {
                    Ok(ips) => return Ok(ips),
                    Err(e) if !e.is_retryable() => {
                        if let Some(prev) = last_err {
                            log::warn!("{} lookup for {} failed: {}", rtype, name, prev);
                        }
                        return Err(e);
                    }
                    Err(e) => {
                        log::debug!("{} lookup for {} via {} failed: {}", rtype, name, ns, e);
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DnsError::NoAddresses(name.to_string())))
    }

    async fn query_server(
        &self,
        pinned: &mut PinnedDial<'_>,
        nameserver: &str,
        name: &Name,
        rtype: RecordType,
    ) -> DnsResult<Vec<IpAddr>> {
        let id = rand::random::<u16>();
        let query = build_query(id, name, rtype)?;

        let exchange = async {
            let mut stream = pinned.dial(nameserver).await?;
            match self.transport {
                Transport::Udp(_) => exchange_datagram(&mut stream, &query, id).await,
                _ => exchange_framed(&mut stream, &query).await,
            }
        };
        let response = tokio::time::timeout(self.query_timeout, exchange)
            .await
            .map_err(|_| {
                DnsError::Network(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} query via {} timed out", rtype, self.config),
                ))
            })??;

        let response = Message::from_vec(&response)?;
        if response.id() != id {
            return Err(DnsError::Message(format!(
                "response id {} does not match query id {}",
                response.id(),
                id
            )));
        }
        match response.response_code() {
            ResponseCode::NoError => Ok(answer_addrs(&response, rtype)),
            ResponseCode::NXDomain => Ok(Vec::new()),
            code => Err(DnsError::Rcode {
                server: self.config.to_string(),
                code: code.to_string(),
            }),
        }
    }

    /// Open a stream to the configured upstream, wrapped for its transport.
    async fn connect(&self) -> DnsResult<BoxStream> {
        match &self.transport {
            Transport::System => Err(DnsError::Config(
                "system resolver has no upstream to dial".into(),
            )),
            Transport::Udp(addr) => Ok(self.dial.dial(Network::Udp, addr).await?),
            Transport::Tcp(addr) => Ok(self.dial.dial(Network::Tcp, addr).await?),
            Transport::Tls {
                addr,
                server_name,
                config,
            } => {
                let stream = self.dial.dial(Network::Tcp, addr).await?;
                let stream = tls::connect(stream, server_name, config.clone()).await?;
                Ok(Box::new(stream))
            }
            Transport::Https(client) => Ok(Box::new(DohStream::new(client.clone()))),
        }
    }
}

#[async_trait]
impl Lookup for Resolver {
    async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        Resolver::lookup_ip(self, host).await
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .field("nameservers", &self.nameservers)
            .finish()
    }
}

/// Call-scoped bootstrap guard.
///
/// Lives for exactly one [`Resolver::lookup_ip`] call. The first requested
/// nameserver is pinned; requests for the same address are redirected to the
/// configured upstream, requests for any other address are refused.
pub struct PinnedDial<'a> {
    resolver: &'a Resolver,
    pinned: Option<String>,
}

impl<'a> PinnedDial<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Self {
            resolver,
            pinned: None,
        }
    }

    /// Nameserver address pinned so far.
    pub fn pinned(&self) -> Option<&str> {
        self.pinned.as_deref()
    }

    /// Dial on behalf of the lookup engine, which asked for `nameserver`.
    pub async fn dial(&mut self, nameserver: &str) -> DnsResult<BoxStream> {
        match &self.pinned {
            None => self.pinned = Some(nameserver.to_string()),
            Some(pinned) if pinned == nameserver => {}
            Some(_) => return Err(DnsError::NotRetry(nameserver.to_string())),
        }
        self.resolver.connect().await
    }
}

fn build_query(id: u16, name: &Name, rtype: RecordType) -> DnsResult<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name.clone(), rtype));
    Ok(message.to_vec()?)
}

fn answer_addrs(response: &Message, rtype: RecordType) -> Vec<IpAddr> {
    response
        .answers()
        .iter()
        .filter_map(|record| match (record.data(), rtype) {
            (Some(RData::A(a)), RecordType::A) => Some(IpAddr::V4(a.0)),
            (Some(RData::AAAA(aaaa)), RecordType::AAAA) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// One query per datagram. Stray datagrams with a foreign id are skipped.
async fn exchange_datagram<S>(stream: &mut S, query: &[u8], id: u16) -> DnsResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(query).await.map_err(DnsError::from_io)?;
    let mut buf = vec![0u8; MAX_MESSAGE];
    loop {
        let n = stream.read(&mut buf).await.map_err(DnsError::from_io)?;
        if n == 0 {
            return Err(DnsError::Message("empty datagram".into()));
        }
        if n >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
            buf.truncate(n);
            return Ok(buf);
        }
        log::debug!("dropping unrelated DNS datagram ({} bytes)", n);
    }
}

/// Length-prefixed exchange used by TCP, TLS and DoH.
async fn exchange_framed<S>(stream: &mut S, query: &[u8]) -> DnsResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let len = u16::try_from(query.len())
        .map_err(|_| DnsError::Message(format!("query too large: {} bytes", query.len())))?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await.map_err(DnsError::from_io)?;
    stream.flush().await.map_err(DnsError::from_io)?;

    let len = stream.read_u16().await.map_err(DnsError::from_io)? as usize;
    let mut response = vec![0u8; len];
    stream
        .read_exact(&mut response)
        .await
        .map_err(DnsError::from_io)?;
    Ok(response)
}

/// IPv4 before IPv6, first occurrence wins, order within a family kept.
pub fn order_addrs(ips: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut ordered: Vec<IpAddr> = Vec::with_capacity(ips.len());
    for ip in ips.iter().filter(|ip| ip.is_ipv4()).chain(ips.iter().filter(|ip| ip.is_ipv6())) {
        if !ordered.contains(ip) {
            ordered.push(*ip);
        }
    }
    ordered
}

/// Nameservers listed in [`RESOLV_CONF`], or the loopback defaults.
pub async fn system_nameservers() -> Vec<SocketAddr> {
    match tokio::fs::read_to_string(RESOLV_CONF).await {
        Ok(text) => parse_resolv_conf(&text),
        Err(e) => {
            log::debug!("cannot read {}: {}", RESOLV_CONF, e);
            default_nameservers()
        }
    }
}

fn default_nameservers() -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53),
    ]
}

/// Extract `nameserver` entries from resolv.conf text.
pub fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    let servers: Vec<SocketAddr> = text
        .lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Drop any IPv6 zone suffix.
                    let addr = addr.split('%').next().unwrap_or(addr);
                    addr.parse::<IpAddr>().ok()
                }
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, 53))
        .collect();
    if servers.is_empty() {
        default_nameservers()
    } else {
        servers
    }
}
