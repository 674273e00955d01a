//! Error types for the WireGuard control layer.

use thiserror::Error;
use tunnel_dns::DnsError;

/// WireGuard control errors.
#[derive(Debug, Error)]
pub enum WgError {
    /// Key or client id could not be decoded.
    #[error("Key error: {0}")]
    Key(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No candidate address of the peer endpoint was reachable.
    #[error("Resolve peer endpoint: {0}")]
    Resolve(String),

    /// Name lookup failed.
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// The tunnel device rejected a request or could not be reached.
    #[error("Device error: {0}")]
    Device(String),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Result type alias for WireGuard control operations.
pub type WgResult<T> = Result<T, WgError>;

