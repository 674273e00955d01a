//! Error types for DNS resolution.

use std::io;
use thiserror::Error;

/// Resolver errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Resolver configuration string could not be parsed.
    #[error("Invalid resolver config: {0}")]
    Config(String),

    /// Socket or stream I/O failed.
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// The lookup engine tried to reach a nameserver other than the one
    /// pinned for this lookup. Never retried.
    #[error("not retry: refusing to dial {0}")]
    NotRetry(String),

    /// DNS-over-HTTPS server answered with a non-200 status.
    #[error("server return {status}: {body}")]
    DohStatus { status: u16, body: String },

    /// HTTP exchange with the DoH server failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// DNS message could not be encoded or decoded.
    #[error("DNS message error: {0}")]
    Message(String),

    /// Nameserver answered with an error response code.
    #[error("DNS server {server} answered {code}")]
    Rcode { server: String, code: String },

    /// Lookup finished without any address.
    #[error("no addresses found for {0}")]
    NoAddresses(String),
}

impl DnsError {
    /// Returns true if the lookup engine may move on to its next nameserver.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DnsError::NotRetry(_) | DnsError::Config(_))
    }

    /// Recover a `DnsError` that was smuggled through an `io::Error`.
    ///
    /// Stream adapters can only report `io::Error` from `poll_read`, so the
    /// DoH adapter wraps its own errors; this unwraps them again.
    pub(crate) fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<DnsError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(dns) = inner.downcast::<DnsError>() {
                    return *dns;
                }
            }
            return DnsError::Network(io::Error::other("DoH exchange failed"));
        }
        DnsError::Network(err)
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            DnsError::Network(err) => err,
            other => io::Error::other(other),
        }
    }
}

/// Result type alias for resolver operations.
pub type DnsResult<T> = Result<T, DnsError>;

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        DnsError::Message(err.to_string())
    }
}
