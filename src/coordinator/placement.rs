//! Block placement (partitioning)
//!
//! Round-robin over online nodes that still have free blocks: each file
//! block gets a primary and `R'-1` replicas on distinct nodes, where
//! `R' = min(R, number of candidate nodes)`. When distinct nodes run out of
//! free blocks, replicas fall back to any node with space (the primary
//! included) and the placement is flagged `degraded`.
//!
//! The computation never touches shared state: it consumes free blocks from
//! a local copy of the snapshot, and the caller applies the result.

use crate::common::node_number;
use crate::coordinator::blocks::BlockTable;
use crate::coordinator::registry::NodeInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Where one block of a file lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// 1-based position of the block within its file
    pub file_block_index: u32,
    pub primary_block_id: String,
    pub primary_node: String,
    pub replica_block_ids: Vec<String>,
    pub replica_nodes: Vec<String>,
    /// Some replica shares a node with the primary or another replica
    #[serde(default)]
    pub degraded: bool,
}

impl Placement {
    /// Primary block id followed by replica block ids
    pub fn block_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_block_id.as_str())
            .chain(self.replica_block_ids.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("No online nodes available to store blocks")]
    NoOnlineNodes,

    #[error("No free blocks available on online nodes")]
    NoFreeBlocks,

    #[error("Could not place primary for block {block}: no free blocks left")]
    PrimaryExhausted { block: u32 },

    #[error("Not enough free blocks to create {copies} copies of block {block}")]
    ReplicasExhausted { block: u32, copies: usize },
}

/// Stateless placement calculator
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    /// Desired copies per block, primary included
    replication: usize,
}

impl Partitioner {
    pub fn new(replication: usize) -> Self {
        Self {
            replication: replication.max(1),
        }
    }

    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Compute placements for `num_blocks` blocks against a block table snapshot.
    pub fn allocate(
        &self,
        num_blocks: u32,
        nodes: &BTreeMap<String, NodeInfo>,
        blocks: &BlockTable,
    ) -> Result<Vec<Placement>, PlacementError> {
        self.allocate_from_free(num_blocks, nodes, &blocks.find_free_by_node())
    }

    /// Compute placements from a `node → free block ids` map.
    ///
    /// Either every block is placed or an error is returned; partial results
    /// are never handed out.
    pub fn allocate_from_free(
        &self,
        num_blocks: u32,
        nodes: &BTreeMap<String, NodeInfo>,
        free_by_node: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<Placement>, PlacementError> {
        if num_blocks == 0 {
            return Ok(Vec::new());
        }

        let mut online: Vec<&NodeInfo> = nodes.values().filter(|n| n.status.is_online()).collect();
        if online.is_empty() {
            return Err(PlacementError::NoOnlineNodes);
        }
        online.sort_by_key(|n| (node_number(&n.id), n.id.clone()));

        let candidates: Vec<String> = online
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| free_by_node.get(id).is_some_and(|free| !free.is_empty()))
            .collect();
        if candidates.is_empty() {
            return Err(PlacementError::NoFreeBlocks);
        }

        let node_count = candidates.len();
        let copies = self.replication.min(node_count.max(1));

        let mut free_local: BTreeMap<&str, VecDeque<String>> = candidates
            .iter()
            .map(|id| {
                let free = free_by_node.get(id).cloned().unwrap_or_default();
                (id.as_str(), VecDeque::from(free))
            })
            .collect();

        // Every block needs at least its primary
        let total_free: usize = free_local.values().map(VecDeque::len).sum();
        if num_blocks as usize > total_free {
            let block = u32::try_from(total_free + 1).unwrap_or(u32::MAX);
            return Err(PlacementError::PrimaryExhausted { block });
        }

        let mut placements = Vec::with_capacity(num_blocks as usize);
        let mut rr_index = 0usize;

        for block in 1..=num_blocks {
            // Primary: next node in rotation that still has space
            let mut primary = None;
            for _ in 0..node_count {
                let candidate = candidates[rr_index % node_count].as_str();
                rr_index += 1;
                if let Some(id) = take_free(&mut free_local, candidate) {
                    primary = Some((candidate, id));
                    break;
                }
            }
            let Some((primary_node, primary_block_id)) = primary else {
                return Err(PlacementError::PrimaryExhausted { block });
            };
            let primary_pos = candidates
                .iter()
                .position(|c| c == primary_node)
                .unwrap_or(0);

            let mut replica_block_ids = Vec::new();
            let mut replica_nodes: Vec<String> = Vec::new();
            let mut needed = copies - 1;

            // Distinct nodes first, starting right after the primary
            for offset in 1..node_count {
                if needed == 0 {
                    break;
                }
                let candidate = candidates[(primary_pos + offset) % node_count].as_str();
                if let Some(id) = take_free(&mut free_local, candidate) {
                    replica_block_ids.push(id);
                    replica_nodes.push(candidate.to_string());
                    needed -= 1;
                }
            }

            // Fallback: any node with space, primary included
            let mut degraded = false;
            while needed > 0 {
                let mut progressed = false;
                for offset in 0..node_count {
                    if needed == 0 {
                        break;
                    }
                    let candidate = candidates[(primary_pos + offset) % node_count].as_str();
                    if let Some(id) = take_free(&mut free_local, candidate) {
                        replica_block_ids.push(id);
                        replica_nodes.push(candidate.to_string());
                        needed -= 1;
                        degraded = true;
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            if needed > 0 {
                return Err(PlacementError::ReplicasExhausted { block, copies });
            }

            if degraded {
                tracing::warn!(
                    block,
                    primary = primary_node,
                    replicas = ?replica_nodes,
                    "not enough distinct nodes; replicas share a node"
                );
            }

            placements.push(Placement {
                file_block_index: block,
                primary_block_id,
                primary_node: primary_node.to_string(),
                replica_block_ids,
                replica_nodes,
                degraded,
            });
        }

        Ok(placements)
    }
}

fn take_free(free_local: &mut BTreeMap<&str, VecDeque<String>>, node: &str) -> Option<String> {
    free_local.get_mut(node).and_then(VecDeque::pop_front)
}
