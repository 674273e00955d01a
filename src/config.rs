//! Configuration for tunnel-http.
//!
//! Settings come from command-line flags (with environment fallbacks) and an
//! optional TOML file. Flags win over the file. The merged settings are
//! validated once into [`Options`]; nothing past this module sees an
//! unchecked value.
//!
//! ```toml
//! client-ip = ["10.0.0.2", "fd00::2"]
//! private-key = "base64..."
//! peer-endpoint = "vpn.example.com:51820"
//! peer-key = "base64..."
//! resolve-dns = "tls://9.9.9.9"
//! resolve-interval = "1m"
//! exit-mode = "remote"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunnel_dns::{HostPort, ResolverConfig};
use tunnel_wg::config::{DEFAULT_LOCAL_KEEPALIVE, DEFAULT_MTU, DEFAULT_RESOLVE_INTERVAL};
use tunnel_wg::{ClientId, InterfaceConfig, PeerConfig, WgKey};

/// Default HTTP & SOCKS5 listen address.
pub const DEFAULT_LISTEN: &str = "localhost:8080";

/// Default UAPI control socket read by the `stats` subcommand.
pub const DEFAULT_UAPI_SOCKET: &str = "/var/run/wireguard/wg0.sock";

/// Where proxied connections leave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    /// Clients connect locally, traffic exits at the WireGuard peer.
    #[default]
    Remote,
    /// Clients connect through the tunnel, traffic exits on this host.
    Local,
}

impl std::fmt::Display for ExitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitMode::Remote => f.write_str("remote"),
            ExitMode::Local => f.write_str("local"),
        }
    }
}

/// Unvalidated settings, shared by the flag parser and the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    pub client_ip: Vec<IpAddr>,
    pub client_port: Option<u16>,
    pub private_key: Option<String>,
    pub dns: Option<String>,
    pub mtu: Option<u16>,
    pub peer_endpoint: Option<String>,
    pub peer_key: Option<String>,
    pub preshared_key: Option<String>,
    #[serde(deserialize_with = "deserialize_interval")]
    pub keepalive_interval: Option<Duration>,
    pub resolve_dns: Option<String>,
    #[serde(deserialize_with = "deserialize_interval")]
    pub resolve_interval: Option<Duration>,
    pub listen: Option<String>,
    pub exit_mode: Option<ExitMode>,
    pub client_id: Option<String>,
    pub uapi_socket: Option<PathBuf>,
}

impl Settings {
    /// Fill every unset value from `file`.
    pub fn merge(self, file: Settings) -> Settings {
        Settings {
            client_ip: if self.client_ip.is_empty() {
                file.client_ip
            } else {
                self.client_ip
            },
            client_port: self.client_port.or(file.client_port),
            private_key: self.private_key.or(file.private_key),
            dns: self.dns.or(file.dns),
            mtu: self.mtu.or(file.mtu),
            peer_endpoint: self.peer_endpoint.or(file.peer_endpoint),
            peer_key: self.peer_key.or(file.peer_key),
            preshared_key: self.preshared_key.or(file.preshared_key),
            keepalive_interval: self.keepalive_interval.or(file.keepalive_interval),
            resolve_dns: self.resolve_dns.or(file.resolve_dns),
            resolve_interval: self.resolve_interval.or(file.resolve_interval),
            listen: self.listen.or(file.listen),
            exit_mode: self.exit_mode.or(file.exit_mode),
            client_id: self.client_id.or(file.client_id),
            uapi_socket: self.uapi_socket.or(file.uapi_socket),
        }
    }

    /// Device control socket, tilde-expanded, or the default.
    pub fn uapi_socket_path(&self) -> PathBuf {
        self.uapi_socket
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UAPI_SOCKET))
    }

    /// Check every value and apply defaults.
    pub fn validate(self) -> Result<Options> {
        if self.client_ip.is_empty() {
            anyhow::bail!("Missing --client-ip (at least one address is required)");
        }

        let private_key = parse_key(self.private_key.as_deref(), "private-key")?;
        let peer_key = parse_key(self.peer_key.as_deref(), "peer-key")?;
        let preshared_key = self
            .preshared_key
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| WgKey::from_base64(s).context("Invalid --preshared-key"))
            .transpose()?;

        let peer_endpoint = self
            .peer_endpoint
            .as_deref()
            .context("Missing --peer-endpoint (format: host:port)")?;
        let peer_endpoint = HostPort::parse(peer_endpoint)
            .with_context(|| format!("Invalid --peer-endpoint '{}'", peer_endpoint))?;

        let dns = ResolverConfig::parse(self.dns.as_deref().unwrap_or_default())
            .context("Invalid --dns")?;
        let resolve_dns = ResolverConfig::parse(self.resolve_dns.as_deref().unwrap_or_default())
            .context("Invalid --resolve-dns")?;

        let mtu = self.mtu.unwrap_or(DEFAULT_MTU);
        validate_mtu(mtu)?;

        let listen = self.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        HostPort::parse(&listen).with_context(|| format!("Invalid --listen '{}'", listen))?;

        let exit_mode = self.exit_mode.unwrap_or_default();
        let keepalive_interval = match self.keepalive_interval {
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval),
            None if exit_mode == ExitMode::Local => Some(DEFAULT_LOCAL_KEEPALIVE),
            None => None,
        };

        let client_id = self
            .client_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| ClientId::from_base64(s).context("Invalid --client-id"))
            .transpose()?;

        let uapi_socket = self.uapi_socket.as_deref().map(expand_tilde);
        if client_id.is_some() && uapi_socket.is_some() {
            anyhow::bail!(
                "--client-id needs the built-in engine; an external device behind \
                 --uapi-socket owns its own sockets"
            );
        }

        Ok(Options {
            client_ips: self.client_ip,
            client_port: self.client_port.filter(|&port| port != 0),
            private_key,
            dns,
            mtu,
            peer_endpoint,
            peer_key,
            preshared_key,
            keepalive_interval,
            resolve_dns,
            resolve_interval: self.resolve_interval.unwrap_or(DEFAULT_RESOLVE_INTERVAL),
            listen,
            exit_mode,
            client_id,
            uapi_socket,
        })
    }
}

/// Validated runtime options.
#[derive(Debug, Clone)]
pub struct Options {
    pub client_ips: Vec<IpAddr>,
    pub client_port: Option<u16>,
    pub private_key: WgKey,
    /// Resolver for hostnames requested by proxy clients.
    pub dns: ResolverConfig,
    pub mtu: u16,
    pub peer_endpoint: HostPort,
    pub peer_key: WgKey,
    pub preshared_key: Option<WgKey>,
    pub keepalive_interval: Option<Duration>,
    /// Resolver for the peer endpoint.
    pub resolve_dns: ResolverConfig,
    pub resolve_interval: Duration,
    pub listen: String,
    pub exit_mode: ExitMode,
    pub client_id: Option<ClientId>,
    /// External device to configure instead of the built-in engine.
    pub uapi_socket: Option<PathBuf>,
}

impl Options {
    /// WireGuard interface and peer described by these options.
    pub fn interface_config(&self) -> InterfaceConfig {
        let mut peer = PeerConfig::new(self.peer_key, self.peer_endpoint.clone());
        if let Some(psk) = self.preshared_key {
            peer = peer.with_preshared_key(psk);
        }
        if let Some(keepalive) = self.keepalive_interval {
            peer = peer.with_keepalive(keepalive);
        }

        let mut interface = InterfaceConfig::new(self.private_key, peer)
            .with_resolver(self.resolve_dns.clone())
            .with_resolve_interval(self.resolve_interval);
        if let Some(port) = self.client_port {
            interface = interface.with_listen_port(port);
        }
        if let Some(id) = self.client_id {
            interface = interface.with_client_id(id);
        }
        interface
    }
}

fn parse_key(value: Option<&str>, flag: &str) -> Result<WgKey> {
    let value = value.with_context(|| format!("Missing --{} (format: base64)", flag))?;
    WgKey::from_base64(value).with_context(|| format!("Invalid --{}", flag))
}

/// Validate MTU value is within acceptable range (576-1500).
fn validate_mtu(mtu: u16) -> Result<()> {
    if !(576..=1500).contains(&mtu) {
        anyhow::bail!("MTU {} is out of range. Valid range: 576-1500", mtu);
    }
    Ok(())
}

/// Parse an interval given as whole seconds (`60`) or a duration (`1m`, `1h30m`).
pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value)
        .map_err(|e| format!("invalid interval '{}': {} (use seconds or e.g. 1m30s)", value, e))
}

fn deserialize_interval<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Interval {
        Secs(u64),
        Text(String),
    }

    match Interval::deserialize(deserializer)? {
        Interval::Secs(secs) => Ok(Some(Duration::from_secs(secs))),
        Interval::Text(text) => parse_interval(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Load settings from a TOML file.
fn load_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve the default config path (~/.config/tunnel-http/config.toml).
fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("tunnel-http").join("config.toml"))
}

/// Load settings from an explicit path, or from the default location.
///
/// - `path`: Some(path) loads from the specified path (tilde-expanded)
/// - `path`: None loads from the default path (~/.config/tunnel-http/config.toml)
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => default_config_path().ok_or_else(|| {
            anyhow::anyhow!("Could not find default config path. Use -c to specify a config file.")
        })?,
    };
    load_config(&config_path)
}
