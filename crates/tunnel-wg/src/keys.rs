//! WireGuard key and client id handling.
//!
//! Keys arrive base64-encoded from the command line or config file and are
//! rendered as lowercase hex for the device control protocol.

use crate::error::{WgError, WgResult};
use base64::Engine;
use boringtun::x25519::{PublicKey, StaticSecret};
use std::fmt;
use std::str::FromStr;

/// A 32-byte WireGuard key (private, public or preshared).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgKey([u8; 32]);

impl WgKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key.
    pub fn from_base64(base64: &str) -> WgResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64.trim())
            .map_err(|e| WgError::Key(format!("Invalid base64: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            WgError::Key(format!(
                "Invalid key length: expected 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Decode a hex key as printed by the device.
    pub fn from_hex(text: &str) -> WgResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text.trim(), &mut bytes)
            .map_err(|e| WgError::Key(format!("Invalid hex key: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, the form the device control protocol expects.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Standard base64, the form keys are exchanged in.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Treat this key as a private key and derive its public key.
    pub fn public_key(&self) -> WgKey {
        let secret = StaticSecret::from(self.0);
        WgKey(PublicKey::from(&secret).to_bytes())
    }
}

impl FromStr for WgKey {
    type Err = WgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material
        f.write_str("WgKey(..)")
    }
}

/// The three bytes written into the reserved section of every outgoing
/// WireGuard message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; 3]);

impl ClientId {
    pub const fn new(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 client id. Exactly three bytes are required.
    pub fn from_base64(base64: &str) -> WgResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64.trim())
            .map_err(|e| WgError::Key(format!("Invalid client id: {}", e)))?;
        let bytes: [u8; 3] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            WgError::Key(format!(
                "Invalid client id length: expected 3 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = WgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}
