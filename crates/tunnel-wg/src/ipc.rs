//! Device control text.
//!
//! WireGuard devices are configured with newline-separated `key=value`
//! lines. Keys are lowercase hex and endpoints are `ip:port` (IPv6 in
//! brackets). A block is submitted as one request and applied whole.

use crate::error::{WgError, WgResult};
use crate::keys::WgKey;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Full configuration applied once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: WgKey,
    pub listen_port: Option<u16>,
    pub public_key: WgKey,
    pub endpoint: SocketAddr,
    pub keepalive: Option<Duration>,
    pub preshared_key: Option<WgKey>,
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "private_key={}", self.private_key)?;
        if let Some(port) = self.listen_port {
            writeln!(f, "listen_port={}", port)?;
        }
        writeln!(f, "public_key={}", self.public_key)?;
        writeln!(f, "endpoint={}", self.endpoint)?;
        writeln!(f, "allowed_ip=0.0.0.0/0")?;
        writeln!(f, "allowed_ip=::/0")?;
        if let Some(keepalive) = self.keepalive {
            writeln!(f, "persistent_keepalive_interval={}", keepalive.as_secs())?;
        }
        if let Some(psk) = &self.preshared_key {
            writeln!(f, "preshared_key={}", psk)?;
        }
        Ok(())
    }
}

/// Incremental endpoint change for an existing peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: WgKey,
    pub endpoint: SocketAddr,
}

impl fmt::Display for PeerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "public_key={}", self.public_key)?;
        writeln!(f, "update_only=true")?;
        writeln!(f, "endpoint={}", self.endpoint)
    }
}

/// Request line for a configuration read.
pub const GET_REQUEST: &str = "get=1\n\n";

/// Wrap a configuration block into a set request.
pub fn set_request(block: &str) -> String {
    let mut request = String::with_capacity(block.len() + 8);
    request.push_str("set=1\n");
    request.push_str(block);
    if !block.ends_with('\n') {
        request.push('\n');
    }
    request.push('\n');
    request
}

/// Split a device reply into its body and check the trailing `errno=`.
///
/// Returns the body (every line before `errno=`) on success.
pub fn parse_reply(reply: &str) -> WgResult<String> {
    let mut body = String::new();
    for line in reply.lines() {
        if let Some(code) = line.strip_prefix("errno=") {
            let code: i64 = code
                .trim()
                .parse()
                .map_err(|_| WgError::Device(format!("malformed reply line '{}'", line)))?;
            if code != 0 {
                return Err(WgError::Device(format!("device returned errno={}", code)));
            }
            return Ok(body);
        }
        body.push_str(line);
        body.push('\n');
    }
    Err(WgError::Device("reply ended without errno".into()))
}
