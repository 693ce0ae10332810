//! UDP discovery
//!
//! A node broadcasts `DISCOVER_COORDINATOR` and gets back where the node
//! port listens plus the id it should register under. Source addresses
//! that are already known keep their id.

use crate::common::{Error, Result};
use crate::coordinator::state::Coordinator;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub const DISCOVERY_REQUEST: &str = "DISCOVER_COORDINATOR";

const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub ip: String,
    pub port: u16,
    pub node_id: String,
}

/// Where nodes should connect, as advertised in discovery replies
#[derive(Debug, Clone)]
pub struct Advertised {
    pub ip: String,
    pub port: u16,
}

impl Advertised {
    pub fn reply_for(&self, coordinator: &Coordinator, source_ip: &str) -> DiscoveryReply {
        DiscoveryReply {
            ip: self.ip.clone(),
            port: self.port,
            node_id: coordinator.reserve_node_id(source_ip),
        }
    }
}

pub async fn run_discovery(
    socket: UdpSocket,
    coordinator: Arc<Coordinator>,
    advertised: Advertised,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = socket.local_addr() {
        tracing::info!(%addr, advertised_ip = %advertised.ip, "discovery responder listening");
    }
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "discovery receive failed");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let request = String::from_utf8_lossy(&buf[..len]);
        if request.trim() != DISCOVERY_REQUEST {
            tracing::debug!(%from, "ignoring unexpected discovery datagram");
            continue;
        }

        let reply = advertised.reply_for(&coordinator, &from.ip().to_string());
        match serde_json::to_vec(&reply) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, from).await {
                    tracing::warn!(%from, error = %e, "discovery reply failed");
                } else {
                    tracing::info!(%from, node_id = %reply.node_id, "answered discovery");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode discovery reply"),
        }
    }

    tracing::info!("discovery responder stopped");
}

/// Ask a coordinator at `target` for a discovery reply.
pub async fn discover(target: SocketAddr, wait: Duration) -> Result<DiscoveryReply> {
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_REQUEST.as_bytes(), target).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let (len, _) = tokio::time::timeout(wait, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Internal(format!("no discovery reply from {target}")))??;
    Ok(serde_json::from_slice(&buf[..len])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_reuses_known_address() {
        let coordinator = Arc::new(Coordinator::in_memory(2));
        coordinator.register("127.0.0.1", 2);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let advertised = Advertised {
            ip: "10.1.1.1".into(),
            port: 5000,
        };
        let task = tokio::spawn(run_discovery(socket, coordinator.clone(), advertised, shutdown_rx));

        let reply = discover(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            reply,
            DiscoveryReply {
                ip: "10.1.1.1".into(),
                port: 5000,
                node_id: "node1".into(),
            }
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_reply_reserves_fresh_id() {
        let coordinator = Coordinator::in_memory(2);
        coordinator.register("10.0.0.1", 1);
        let advertised = Advertised {
            ip: "10.0.0.100".into(),
            port: 5000,
        };

        let first = advertised.reply_for(&coordinator, "10.0.0.2");
        let again = advertised.reply_for(&coordinator, "10.0.0.2");
        assert_eq!(first.node_id, "node2");
        assert_eq!(again.node_id, "node2");
        // Unregistered reservation is not a node yet
        assert!(coordinator.node("node2").is_none());
    }
}
