//! Resolver configuration strings.
//!
//! Format: `[protocol://]host[:port][/path]`
//!
//! | input | transport | default port |
//! |---|---|---|
//! | `""` | host system resolver | - |
//! | `host[:port]`, `udp://host[:port]` | plain UDP | 53 |
//! | `tcp://host[:port]` | plain TCP | 53 |
//! | `tls://host[:port]` | DNS-over-TLS | 853 |
//! | `https://host[:port][/path]` | DNS-over-HTTPS | 443, path `/dns-query` |

use crate::error::{DnsError, DnsResult};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use url::Url;

/// Default port for plain DNS.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Default port for DNS-over-TLS.
pub const DEFAULT_DOT_PORT: u16 = 853;

/// Default port for DNS-over-HTTPS.
pub const DEFAULT_DOH_PORT: u16 = 443;

/// RFC 8484 well-known query path.
pub const DEFAULT_DOH_PATH: &str = "/dns-query";

/// A `host:port` pair. The host may be a name or an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port`, or a bare host which gets `default_port`.
    pub fn parse_with_default(s: &str, default_port: u16) -> DnsResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DnsError::Config("empty host".into()));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::new(addr.ip().to_string(), addr.port()));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), default_port));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| DnsError::Config(format!("missing ']' in '{}'", s)))?;
            host.parse::<IpAddr>()
                .map_err(|_| DnsError::Config(format!("invalid IPv6 address in '{}'", s)))?;
            let port = match tail {
                "" => default_port,
                _ => parse_port(tail.strip_prefix(':').unwrap_or(tail), s)?,
            };
            return Ok(Self::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                validate_host(host, s)?;
                Ok(Self::new(host, parse_port(port, s)?))
            }
            None => {
                validate_host(s, s)?;
                Ok(Self::new(s, default_port))
            }
        }
    }

    /// Parse a strict `host:port` pair (port required).
    pub fn parse(s: &str) -> DnsResult<Self> {
        let s = s.trim();
        if s.parse::<IpAddr>().is_ok() || !s.contains(':') || s.ends_with(']') {
            return Err(DnsError::Config(format!(
                "missing port in address '{}' (expected host:port)",
                s
            )));
        }
        Self::parse_with_default(s, 0)
    }

    /// The host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_port(port: &str, input: &str) -> DnsResult<u16> {
    port.parse::<u16>()
        .map_err(|_| DnsError::Config(format!("invalid port '{}' in '{}'", port, input)))
}

fn validate_host(host: &str, input: &str) -> DnsResult<()> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DnsError::Config(format!("invalid host '{}' in '{}'", host, input)))
    }
}

/// Which transport a resolver uses and where it sends queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResolverConfig {
    /// Host system resolver.
    #[default]
    System,
    /// Plain DNS over UDP.
    Udp(HostPort),
    /// Plain DNS over TCP.
    Tcp(HostPort),
    /// DNS-over-TLS. `server_name` is verified against the certificate.
    Tls {
        addr: HostPort,
        server_name: String,
    },
    /// DNS-over-HTTPS (RFC 8484).
    Https(Url),
}

impl ResolverConfig {
    /// Parse a resolver configuration string.
    ///
    /// Parsing never touches the network.
    pub fn parse(s: &str) -> DnsResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ResolverConfig::System);
        }

        if let Some(rest) = s.strip_prefix("tls://") {
            let addr = HostPort::parse_with_default(rest, DEFAULT_DOT_PORT)?;
            let server_name = addr.host.clone();
            return Ok(ResolverConfig::Tls { addr, server_name });
        }
        if s.starts_with("https://") {
            return parse_doh_url(s).map(ResolverConfig::Https);
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            return HostPort::parse_with_default(rest, DEFAULT_DNS_PORT).map(ResolverConfig::Tcp);
        }
        if let Some(rest) = s.strip_prefix("udp://") {
            return HostPort::parse_with_default(rest, DEFAULT_DNS_PORT).map(ResolverConfig::Udp);
        }
        if s.contains("://") {
            return Err(DnsError::Config(format!(
                "unsupported protocol in '{}' (expected udp, tcp, tls or https)",
                s
            )));
        }
        HostPort::parse_with_default(s, DEFAULT_DNS_PORT).map(ResolverConfig::Udp)
    }

    /// Short name of the transport, for logging.
    pub fn transport_name(&self) -> &'static str {
        match self {
            ResolverConfig::System => "system",
            ResolverConfig::Udp(_) => "udp",
            ResolverConfig::Tcp(_) => "tcp",
            ResolverConfig::Tls { .. } => "tls",
            ResolverConfig::Https(_) => "https",
        }
    }
}

impl FromStr for ResolverConfig {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverConfig::System => f.write_str("system"),
            ResolverConfig::Udp(addr) => write!(f, "udp://{}", addr),
            ResolverConfig::Tcp(addr) => write!(f, "tcp://{}", addr),
            ResolverConfig::Tls { addr, .. } => write!(f, "tls://{}", addr),
            ResolverConfig::Https(url) => write!(f, "{}", url),
        }
    }
}

fn parse_doh_url(s: &str) -> DnsResult<Url> {
    let mut url =
        Url::parse(s).map_err(|e| DnsError::Config(format!("invalid URL '{}': {}", s, e)))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(DnsError::Config(format!("missing host in '{}'", s)));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_DOH_PATH);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_system() {
        assert_eq!(ResolverConfig::parse("").unwrap(), ResolverConfig::System);
        assert_eq!(ResolverConfig::parse("  ").unwrap(), ResolverConfig::System);
    }

    #[test]
    fn test_bare_host_is_udp_with_default_port() {
        assert_eq!(
            ResolverConfig::parse("223.5.5.5").unwrap(),
            ResolverConfig::Udp(HostPort::new("223.5.5.5", 53))
        );
        assert_eq!(
            ResolverConfig::parse("223.5.5.5:5353").unwrap(),
            ResolverConfig::Udp(HostPort::new("223.5.5.5", 5353))
        );
        assert_eq!(
            ResolverConfig::parse("udp://dns.example").unwrap(),
            ResolverConfig::Udp(HostPort::new("dns.example", 53))
        );
    }

    #[test]
    fn test_tcp_prefix() {
        assert_eq!(
            ResolverConfig::parse("tcp://223.5.5.5").unwrap(),
            ResolverConfig::Tcp(HostPort::new("223.5.5.5", 53))
        );
        assert_eq!(
            ResolverConfig::parse("tcp://[2001:db8::1]:5353").unwrap(),
            ResolverConfig::Tcp(HostPort::new("2001:db8::1", 5353))
        );
    }

    #[test]
    fn test_tls_uses_host_as_server_name() {
        match ResolverConfig::parse("tls://9.9.9.9").unwrap() {
            ResolverConfig::Tls { addr, server_name } => {
                assert_eq!(addr, HostPort::new("9.9.9.9", 853));
                assert_eq!(server_name, "9.9.9.9");
            }
            other => panic!("unexpected config: {:?}", other),
        }
        match ResolverConfig::parse("tls://dns.quad9.net:8853").unwrap() {
            ResolverConfig::Tls { addr, server_name } => {
                assert_eq!(addr.port, 8853);
                assert_eq!(server_name, "dns.quad9.net");
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_https_default_path() {
        let ResolverConfig::Https(url) = ResolverConfig::parse("https://223.5.5.5").unwrap() else {
            panic!("expected https");
        };
        assert_eq!(url.path(), "/dns-query");
        assert_eq!(url.port_or_known_default(), Some(443));

        let ResolverConfig::Https(url) =
            ResolverConfig::parse("https://doh.example:8443/resolve").unwrap()
        else {
            panic!("expected https");
        };
        assert_eq!(url.path(), "/resolve");
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn test_malformed_configs_rejected() {
        for bad in [
            "quic://1.1.1.1",
            "tcp://",
            "1.1.1.1:notaport",
            "1.1.1.1:70000",
            "https://",
            "bad host:53",
            "tls://[::1",
        ] {
            assert!(
                ResolverConfig::parse(bad).is_err(),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_host_port_strict_parse() {
        assert_eq!(
            HostPort::parse("vpn.example.com:51820").unwrap(),
            HostPort::new("vpn.example.com", 51820)
        );
        assert_eq!(
            HostPort::parse("[2001:db8::1]:51820").unwrap(),
            HostPort::new("2001:db8::1", 51820)
        );
        assert!(HostPort::parse("vpn.example.com").is_err());
        assert!(HostPort::parse("2001:db8::1").is_err());
        assert!(HostPort::parse("[2001:db8::1]").is_err());
    }

    #[test]
    fn test_host_port_display_brackets_ipv6() {
        assert_eq!(HostPort::new("2001:db8::1", 53).to_string(), "[2001:db8::1]:53");
        assert_eq!(HostPort::new("1.1.1.1", 53).to_string(), "1.1.1.1:53");
    }
}
