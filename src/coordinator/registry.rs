//! Node registry
//!
//! Maps node ids to their metadata and lifecycle status. Records are never
//! removed, only marked offline, so block ownership and file placements stay
//! resolvable. The registry is plain data; the `Coordinator` persists it
//! after every mutation.

use crate::common::{node_id_for, node_number, timestamp_now, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Node metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub id: String,
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    /// Declared capacity in whole blocks
    #[serde(default)]
    pub capacity: u32,
    pub status: NodeStatus,
    /// Blocks currently holding a primary or replica
    #[serde(default)]
    pub used: u32,
    #[serde(default = "timestamp_now")]
    pub last_seen: DateTime<Utc>,
}

/// Outcome of a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub node_id: String,
    /// A new record was created
    pub created: bool,
    /// The node was already online before this registration
    pub was_online: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRegistry {
    #[serde(rename = "nodos", default)]
    nodes: BTreeMap<String, NodeInfo>,

    /// Ids handed out by discovery that have not registered yet (ip → id)
    #[serde(skip)]
    reservations: BTreeMap<String, String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records, restoring ids from the map keys.
    pub fn from_records(nodes: BTreeMap<String, NodeInfo>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|(id, mut info)| {
                info.id = id.clone();
                (id, info)
            })
            .collect();
        Self {
            nodes,
            reservations: BTreeMap::new(),
        }
    }

    /// Register by source address.
    ///
    /// A node already known under `ip` keeps its id and comes back online;
    /// otherwise the next sequential id is allocated.
    pub fn register(&mut self, ip: &str, capacity: u32) -> Registration {
        let node_id = match self.find_by_ip(ip) {
            Some(existing) => existing,
            None => self.reservation_or_allocate(ip),
        };
        self.upsert(&node_id, ip, None, Some(capacity))
    }

    /// Register under an id the node already holds (from discovery or a
    /// previous session). `capacity` of `None` keeps the recorded value.
    pub fn register_as(
        &mut self,
        node_id: &str,
        ip: &str,
        port: Option<u16>,
        capacity: Option<u32>,
    ) -> Registration {
        if let Some(existing) = self.nodes.get(node_id) {
            if existing.ip != ip {
                tracing::warn!(
                    node_id,
                    old_ip = %existing.ip,
                    new_ip = %ip,
                    "node re-registered from a different address"
                );
            }
        }
        self.reservations.retain(|_, reserved| reserved != node_id);
        self.upsert(node_id, ip, port, capacity)
    }

    /// Discovery-time id assignment: reuse the id bound to `ip`, or hand
    /// out a fresh one and remember it until the node registers.
    pub fn reserve(&mut self, ip: &str) -> String {
        if let Some(existing) = self.find_by_ip(ip) {
            return existing;
        }
        self.reservation_or_allocate(ip)
    }

    fn reservation_or_allocate(&mut self, ip: &str) -> String {
        if let Some(reserved) = self.reservations.get(ip) {
            return reserved.clone();
        }
        let node_id = node_id_for(self.next_number());
        self.reservations.insert(ip.to_string(), node_id.clone());
        node_id
    }

    fn upsert(
        &mut self,
        node_id: &str,
        ip: &str,
        port: Option<u16>,
        capacity: Option<u32>,
    ) -> Registration {
        self.reservations.remove(ip);
        let now = timestamp_now();

        match self.nodes.get_mut(node_id) {
            Some(info) => {
                let was_online = info.status.is_online();
                info.ip = ip.to_string();
                if let Some(port) = port {
                    info.port = port;
                }
                if let Some(capacity) = capacity {
                    info.capacity = capacity;
                }
                info.status = NodeStatus::Online;
                info.last_seen = now;
                Registration {
                    node_id: node_id.to_string(),
                    created: false,
                    was_online,
                }
            }
            None => {
                self.nodes.insert(
                    node_id.to_string(),
                    NodeInfo {
                        id: node_id.to_string(),
                        ip: ip.to_string(),
                        port: port.unwrap_or(0),
                        capacity: capacity.unwrap_or(0),
                        status: NodeStatus::Online,
                        used: 0,
                        last_seen: now,
                    },
                );
                Registration {
                    node_id: node_id.to_string(),
                    created: true,
                    was_online: false,
                }
            }
        }
    }

    /// Lowest-numbered node recorded under `ip`
    pub fn find_by_ip(&self, ip: &str) -> Option<String> {
        self.nodes
            .values()
            .filter(|info| info.ip == ip)
            .min_by_key(|info| (node_number(&info.id), info.id.clone()))
            .map(|info| info.id.clone())
    }

    /// Next number above every issued id, reserved ones included.
    ///
    /// Once the top of the range is taken, falls back to the lowest number
    /// no id carries.
    fn next_number(&self) -> u64 {
        let taken: BTreeSet<u64> = self
            .nodes
            .keys()
            .chain(self.reservations.values())
            .map(|id| node_number(id))
            .collect();
        let highest = taken.last().copied().unwrap_or(0);
        highest
            .checked_add(1)
            .or_else(|| (1..u64::MAX).find(|n| !taken.contains(n)))
            .unwrap_or(0)
    }

    /// Returns true if the status changed.
    pub fn mark_online(&mut self, node_id: &str) -> bool {
        self.set_status(node_id, NodeStatus::Online)
    }

    /// Returns true if the status changed. The record is kept.
    pub fn mark_offline(&mut self, node_id: &str) -> bool {
        self.set_status(node_id, NodeStatus::Offline)
    }

    fn set_status(&mut self, node_id: &str, status: NodeStatus) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(info) => {
                let changed = info.status != status;
                info.status = status;
                info.last_seen = timestamp_now();
                changed
            }
            None => false,
        }
    }

    /// Refresh `last_seen`. Returns false for unknown nodes.
    pub fn touch(&mut self, node_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(info) => {
                info.last_seen = timestamp_now();
                true
            }
            None => false,
        }
    }

    pub fn set_used(&mut self, node_id: &str, used: u32) {
        if let Some(info) = self.nodes.get_mut(node_id) {
            info.used = used;
        }
    }

    /// Startup: nothing is connected yet.
    pub fn mark_all_offline(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for info in self.nodes.values_mut() {
            if info.status.is_online() {
                info.status = NodeStatus::Offline;
                changed.push(info.id.clone());
            }
        }
        changed
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|info| info.status.is_online())
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Read-only copy for the partitioner and API consumers
    pub fn snapshot(&self) -> BTreeMap<String, NodeInfo> {
        self.nodes.clone()
    }
}
