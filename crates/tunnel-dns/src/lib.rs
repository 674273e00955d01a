//! Pinned multi-transport DNS lookups for tunnel-http.
//!
//! A resolver is described by a single configuration string:
//!
//! ```text
//! ""                       host system resolver
//! 223.5.5.5[:53]           plain UDP        (udp:// prefix optional)
//! tcp://223.5.5.5[:53]     plain TCP
//! tls://dns.quad9.net      DNS-over-TLS     (port 853)
//! https://223.5.5.5        DNS-over-HTTPS   (port 443, path /dns-query)
//! ```
//!
//! Every connection is made through an injectable [`Dial`], so lookups can be
//! routed over the host network or through a tunnel.

pub mod config;
pub mod dial;
pub mod doh;
pub mod error;
pub mod resolver;
pub mod resolving;
pub mod tls;

pub use config::{HostPort, ResolverConfig};
pub use dial::{AsyncStream, BoxStream, Dial, DirectDialer, Network};
pub use doh::{DohClient, DohStream};
pub use error::{DnsError, DnsResult};
pub use resolver::{Lookup, PinnedDial, Resolver};
pub use resolving::{resolving_dialer, ResolvingDialer};
pub use tls::ensure_crypto_provider;
