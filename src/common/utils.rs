//! Utility functions for miniblock

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Size of one storage block (1 MiB)
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// Prefix of coordinator-assigned node ids
pub const NODE_ID_PREFIX: &str = "node";

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Number of whole blocks needed to hold `bytes`
pub fn blocks_for_size(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE)
}

/// Current wall-clock time
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now()
}

/// Trailing number of a node id (`node12` → 12, `edge-7` → 7, `alpha` → 0)
pub fn node_number(node_id: &str) -> u64 {
    let digits: String = node_id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

/// Build a node id from its sequence number
pub fn node_id_for(number: u64) -> String {
    format!("{}{}", NODE_ID_PREFIX, number)
}

/// Best-effort detection of an address other hosts can reach us on.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick
/// the outbound interface.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Node lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    /// Can this node receive new placements?
    pub fn is_online(&self) -> bool {
        matches!(self, NodeStatus::Online)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}
