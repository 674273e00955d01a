//! Tunnel device control boundary.
//!
//! A WireGuard device is driven through [`TunnelDevice`], which accepts
//! configuration blocks and reports the current state as text. The device is
//! either the in-process [`EngineDevice`](crate::engine::EngineDevice) or an
//! external one reached over its UAPI socket.

use crate::error::{WgError, WgResult};
use async_trait::async_trait;

/// A WireGuard device that accepts textual configuration.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Apply one configuration block atomically.
    async fn ipc_set(&self, block: &str) -> WgResult<()>;

    /// Read the device state as `key=value` lines.
    async fn ipc_get(&self) -> WgResult<String>;
}

#[cfg(unix)]
pub use uapi::UapiDevice;

#[cfg(unix)]
mod uapi {
    use super::*;
    use crate::ipc::{parse_reply, set_request, GET_REQUEST};
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    /// Device reached over the cross-platform WireGuard UAPI socket.
    #[derive(Debug, Clone)]
    pub struct UapiDevice {
        path: PathBuf,
    }

    impl UapiDevice {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Send one request and collect the reply up to its `errno=` line.
        async fn request(&self, request: &str) -> WgResult<String> {
            let stream = UnixStream::connect(&self.path).await.map_err(|e| {
                WgError::Device(format!("connect {}: {}", self.path.display(), e))
            })?;
            let (read, mut write) = stream.into_split();
            write.write_all(request.as_bytes()).await?;
            write.flush().await?;

            let mut reader = BufReader::new(read);
            let mut reply = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await? == 0 {
                    break;
                }
                let done = line.starts_with("errno=");
                reply.push_str(&line);
                if done {
                    break;
                }
            }
            parse_reply(&reply)
        }
    }

    #[async_trait]
    impl TunnelDevice for UapiDevice {
        async fn ipc_set(&self, block: &str) -> WgResult<()> {
            log::debug!("Configuring device via {}", self.path.display());
            self.request(&set_request(block)).await.map(|_| ())
        }

        async fn ipc_get(&self) -> WgResult<String> {
            self.request(GET_REQUEST).await
        }
    }
}
