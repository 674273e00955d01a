//! Device statistics snapshot.

use crate::device::TunnelDevice;
use crate::error::WgResult;
use serde::Serialize;

/// Peer counters read from the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats {
    pub endpoint: String,
    pub last_handshake_timestamp: i64,
    pub received_bytes: i64,
    pub sent_bytes: i64,
}

impl Stats {
    /// Parse the `key=value` lines returned by a device read.
    ///
    /// Unknown keys are ignored and unparsable counters read as zero.
    pub fn from_ipc(text: &str) -> Self {
        let mut stats = Stats::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "endpoint" => stats.endpoint = value.to_string(),
                "last_handshake_time_sec" => {
                    stats.last_handshake_timestamp = value.parse().unwrap_or_default()
                }
                "rx_bytes" => stats.received_bytes = value.parse().unwrap_or_default(),
                "tx_bytes" => stats.sent_bytes = value.parse().unwrap_or_default(),
                _ => {}
            }
        }
        stats
    }
}

/// Read the device state and summarize it.
pub async fn snapshot(device: &dyn TunnelDevice) -> WgResult<Stats> {
    let text = device.ipc_get().await?;
    Ok(Stats::from_ipc(&text))
}
