//! WireGuard control layer for tunnel-http.
//!
//! This crate runs and configures a WireGuard device with a single peer:
//! - **keys**: base64 input, hex output, client ids
//! - **ipc**: device configuration text (full and incremental blocks)
//! - **peer**: endpoint resolution, reachability probing and periodic refresh
//! - **bind**: the UDP packet transport, optionally rewriting reserved header bytes
//! - **device**: the control boundary, with a UAPI socket client
//! - **engine**: the in-process boringtun device and its IP packet boundary
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        tunnel-wg                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  Resolver ──► Peer ──► PeerManager ──► TunnelDevice (IPC)│
//! ├──────────────────────────────────────────────────────────┤
//! │  engine ◄──► Bind (ClientIdBind ◄──► UdpBind) ◄──► peer  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod bind;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod keys;
pub mod peer;
pub mod stats;

// Re-exports for convenience
pub use bind::{new_bind, Bind, ClientIdBind, Endpoint, ReceiveFn, UdpBind};
pub use config::{InterfaceConfig, PeerConfig};
pub use device::TunnelDevice;
#[cfg(unix)]
pub use device::UapiDevice;
pub use engine::{EngineDevice, TunnelPackets};
pub use error::{WgError, WgResult};
pub use ipc::{DeviceConfig, PeerUpdate};
pub use keys::{ClientId, WgKey};
pub use peer::{Peer, PeerManager, Reachability, RefreshHandle, UdpProbe};
pub use stats::Stats;
