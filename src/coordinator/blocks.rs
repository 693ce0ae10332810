//! Block table
//!
//! Every node owns as many blocks as its declared capacity. Block ids are
//! derived from the owner's number and a per-node index (`N<num><index:03>`),
//! so the table can always be rebuilt from the registry.

use crate::common::node_number;
use crate::coordinator::placement::Placement;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Free,
    Occupied,
    Replica,
    Unavailable,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStatus::Free => write!(f, "free"),
            BlockStatus::Occupied => write!(f, "occupied"),
            BlockStatus::Replica => write!(f, "replica"),
            BlockStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "node")]
    pub node_id: String,
    pub index: u32,
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_for: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_for: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Block {
    /// Holds a primary or replica association
    pub fn is_in_use(&self) -> bool {
        self.primary_for.is_some() || !self.replica_for.is_empty()
    }

    /// Status implied by the associations alone
    fn implied_status(&self) -> BlockStatus {
        if self.primary_for.is_some() {
            BlockStatus::Occupied
        } else if !self.replica_for.is_empty() {
            BlockStatus::Replica
        } else {
            BlockStatus::Free
        }
    }
}

/// Deterministic block id for a node's `index`-th block
pub fn block_id(node_id: &str, index: u32) -> String {
    format!("N{}{:03}", node_number(node_id), index)
}

/// What a resize did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// In-use blocks kept past the requested capacity
    pub pinned: usize,
}

impl ResizeOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockTable {
    #[serde(default)]
    blocks: BTreeMap<String, Block>,
    #[serde(default)]
    table_size: usize,

    /// Last capacity requested per node, used to trim pinned blocks once freed
    #[serde(skip)]
    targets: BTreeMap<String, u32>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: BTreeMap<String, Block>) -> Self {
        let table_size = blocks.len();
        Self {
            blocks,
            table_size,
            targets: BTreeMap::new(),
        }
    }

    /// Make `node_id` own exactly `capacity` blocks.
    ///
    /// Growth fills the lowest unused indices with free blocks. Shrinking
    /// drops unused blocks from the highest index down and never drops an
    /// occupied or replica block; those are reported as `pinned` and trimmed
    /// when released.
    pub fn resize_for_node(&mut self, node_id: &str, capacity: u32) -> ResizeOutcome {
        self.targets.insert(node_id.to_string(), capacity);

        let mut outcome = ResizeOutcome::default();
        let owned = self.blocks_of(node_id).count();
        let desired = capacity as usize;

        if desired > owned {
            let used_indices: BTreeSet<u32> =
                self.blocks_of(node_id).map(|block| block.index).collect();
            let mut index = 0u32;
            while outcome.added.len() < desired - owned {
                index += 1;
                if used_indices.contains(&index) {
                    continue;
                }
                let id = block_id(node_id, index);
                // Another node with the same number already holds this id
                if self.blocks.contains_key(&id) {
                    continue;
                }
                self.blocks.insert(
                    id.clone(),
                    Block {
                        id: id.clone(),
                        node_id: node_id.to_string(),
                        index,
                        status: BlockStatus::Free,
                        primary_for: None,
                        replica_for: Vec::new(),
                        path: None,
                    },
                );
                outcome.added.push(id);
            }
        } else if desired < owned {
            let (removed, pinned) = self.trim(node_id, owned - desired);
            outcome.removed = removed;
            outcome.pinned = pinned;
        }

        self.table_size = self.blocks.len();
        outcome
    }

    /// Remove up to `excess` unused blocks of a node, highest index first.
    fn trim(&mut self, node_id: &str, excess: usize) -> (Vec<String>, usize) {
        let mut removable: Vec<(u32, String)> = self
            .blocks_of(node_id)
            .filter(|block| !block.is_in_use())
            .map(|block| (block.index, block.id.clone()))
            .collect();
        removable.sort_by(|a, b| b.0.cmp(&a.0));

        let removed: Vec<String> = removable
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect();
        for id in &removed {
            self.blocks.remove(id);
        }

        let pinned = excess - removed.len();
        if pinned > 0 {
            tracing::warn!(
                node_id,
                pinned,
                "capacity shrink kept in-use blocks; they will be trimmed once released"
            );
        }
        (removed, pinned)
    }

    /// Node went offline: nothing of it may be placed on.
    pub fn set_unavailable(&mut self, node_id: &str) -> bool {
        let mut changed = false;
        for block in self.blocks.values_mut().filter(|b| b.node_id == node_id) {
            if block.status != BlockStatus::Unavailable {
                block.status = BlockStatus::Unavailable;
                changed = true;
            }
        }
        changed
    }

    /// Node is back: blocks regain the status their associations imply.
    pub fn set_available(&mut self, node_id: &str) -> bool {
        let mut changed = false;
        for block in self.blocks.values_mut().filter(|b| b.node_id == node_id) {
            if block.status == BlockStatus::Unavailable {
                block.status = block.implied_status();
                changed = true;
            }
        }
        changed
    }

    /// Mark primaries occupied and replicas as replica for `file_id`.
    /// Returns whether anything changed.
    pub fn assign(&mut self, file_id: &str, placements: &[Placement]) -> bool {
        let mut changed = false;
        for placement in placements {
            if let Some(block) = self.blocks.get_mut(&placement.primary_block_id) {
                block.status = BlockStatus::Occupied;
                block.primary_for = Some(file_id.to_string());
                changed = true;
            }
            for replica_id in &placement.replica_block_ids {
                if let Some(block) = self.blocks.get_mut(replica_id) {
                    if block.primary_for.is_none() {
                        block.status = BlockStatus::Replica;
                    }
                    if !block.replica_for.iter().any(|f| f == file_id) {
                        block.replica_for.push(file_id.to_string());
                    }
                    changed = true;
                }
            }
        }
        changed
    }

    /// Free the listed blocks and drop their associations and payload paths.
    ///
    /// Blocks of an offline node stay unavailable until it returns. Nodes
    /// left over capacity by an earlier shrink are trimmed afterwards.
    pub fn release<S: AsRef<str>>(&mut self, block_ids: &[S]) -> bool {
        let mut changed = false;
        let mut touched_nodes = BTreeSet::new();

        for id in block_ids {
            if let Some(block) = self.blocks.get_mut(id.as_ref()) {
                block.primary_for = None;
                block.replica_for.clear();
                block.path = None;
                if block.status != BlockStatus::Unavailable {
                    block.status = BlockStatus::Free;
                }
                touched_nodes.insert(block.node_id.clone());
                changed = true;
            }
        }

        for node_id in touched_nodes {
            self.trim_to_target(&node_id);
        }
        self.table_size = self.blocks.len();
        changed
    }

    fn trim_to_target(&mut self, node_id: &str) {
        let Some(&target) = self.targets.get(node_id) else {
            return;
        };
        let owned = self.blocks_of(node_id).count();
        if owned > target as usize {
            let (removed, _) = self.trim(node_id, owned - target as usize);
            if !removed.is_empty() {
                tracing::debug!(node_id, removed = removed.len(), "trimmed released blocks past capacity");
            }
        }
    }

    /// Record where a block's payload lives
    pub fn set_path(&mut self, block_id: &str, path: PathBuf) -> bool {
        match self.blocks.get_mut(block_id) {
            Some(block) => {
                block.path = Some(path);
                true
            }
            None => false,
        }
    }

    /// Free block ids per node, in index order
    pub fn find_free_by_node(&self) -> BTreeMap<String, Vec<String>> {
        let mut free: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
        for block in self.blocks.values() {
            if block.status == BlockStatus::Free {
                free.entry(block.node_id.clone())
                    .or_default()
                    .push((block.index, block.id.clone()));
            }
        }
        free.into_iter()
            .map(|(node, mut ids)| {
                ids.sort();
                (node, ids.into_iter().map(|(_, id)| id).collect())
            })
            .collect()
    }

    /// True if every listed block exists, is free and belongs to `node_id`
    pub fn is_free_on(&self, block_id: &str, node_id: &str) -> bool {
        self.blocks
            .get(block_id)
            .map(|b| b.status == BlockStatus::Free && b.node_id == node_id)
            .unwrap_or(false)
    }

    pub fn used_by_node(&self, node_id: &str) -> u32 {
        self.blocks_of(node_id).filter(|b| b.is_in_use()).count() as u32
    }

    /// Drop unused blocks of nodes the registry does not know.
    pub fn retain_known_nodes(&mut self, known: &BTreeSet<String>) -> usize {
        let before = self.blocks.len();
        self.blocks
            .retain(|_, block| known.contains(&block.node_id) || block.is_in_use());
        self.table_size = self.blocks.len();
        before - self.blocks.len()
    }

    /// Drop associations to files that no longer exist. Returns affected blocks.
    pub fn retain_files(&mut self, files: &BTreeSet<String>) -> usize {
        let mut affected = 0;
        for block in self.blocks.values_mut() {
            let mut touched = false;
            if block.primary_for.as_ref().is_some_and(|f| !files.contains(f)) {
                block.primary_for = None;
                touched = true;
            }
            let before = block.replica_for.len();
            block.replica_for.retain(|f| files.contains(f));
            touched |= block.replica_for.len() != before;

            if touched {
                affected += 1;
                if !block.is_in_use() {
                    block.path = None;
                }
                if block.status != BlockStatus::Unavailable {
                    block.status = block.implied_status();
                }
            }
        }
        affected
    }

    pub fn blocks_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.values().filter(move |b| b.node_id == node_id)
    }

    pub fn get(&self, block_id: &str) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    pub fn snapshot(&self) -> BTreeMap<String, Block> {
        self.blocks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(index: u32, primary: &str, replicas: &[&str]) -> Placement {
        Placement {
            file_block_index: index,
            primary_block_id: primary.to_string(),
            primary_node: String::new(),
            replica_block_ids: replicas.iter().map(|s| s.to_string()).collect(),
            replica_nodes: Vec::new(),
            degraded: false,
        }
    }

    fn assert_invariants(table: &BlockTable) {
        for block in table.iter() {
            match block.status {
                BlockStatus::Occupied => assert!(block.primary_for.is_some(), "{}", block.id),
                BlockStatus::Replica => assert!(!block.replica_for.is_empty(), "{}", block.id),
                BlockStatus::Free => {
                    assert!(block.primary_for.is_none(), "{}", block.id);
                    assert!(block.replica_for.is_empty(), "{}", block.id);
                }
                BlockStatus::Unavailable => {}
            }
        }
    }

    #[test]
    fn test_block_id_format() {
        assert_eq!(block_id("node1", 1), "N1001");
        assert_eq!(block_id("node12", 7), "N12007");
        assert_eq!(block_id("alpha", 3), "N0003");
    }

    #[test]
    fn test_grow_then_shrink_keeps_lowest() {
        let mut table = BlockTable::new();
        let grown = table.resize_for_node("node1", 3);
        assert_eq!(grown.added, vec!["N1001", "N1002", "N1003"]);
        assert_eq!(table.blocks_of("node1").count(), 3);
        assert!(table.iter().all(|b| b.status == BlockStatus::Free));

        let shrunk = table.resize_for_node("node1", 1);
        assert_eq!(shrunk.removed, vec!["N1003", "N1002"]);
        assert_eq!(shrunk.pinned, 0);
        let remaining: Vec<_> = table.blocks_of("node1").map(|b| b.id.clone()).collect();
        assert_eq!(remaining, vec!["N1001"]);
        assert_eq!(table.table_size(), 1);
    }

    #[test]
    fn test_count_matches_capacity_across_resizes() {
        let mut table = BlockTable::new();
        for capacity in [4, 2, 7, 0, 5, 5, 1] {
            table.resize_for_node("node2", capacity);
            table.resize_for_node("node3", capacity + 1);
            assert_eq!(table.blocks_of("node2").count(), capacity as usize);
            assert_eq!(table.blocks_of("node3").count(), capacity as usize + 1);
        }
    }

    #[test]
    fn test_shrink_never_drops_in_use_blocks() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 3);
        table.assign("file-a", &[placement(1, "N1003", &[])]);

        let outcome = table.resize_for_node("node1", 1);
        assert_eq!(outcome.removed, vec!["N1002", "N1001"]);
        assert_eq!(outcome.pinned, 0);
        assert!(table.get("N1003").is_some());

        let outcome = table.resize_for_node("node1", 0);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.pinned, 1);

        // Releasing the pinned block trims it
        table.release(&["N1003"]);
        assert_eq!(table.blocks_of("node1").count(), 0);
    }

    #[test]
    fn test_regrow_fills_gaps() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 3);
        table.assign("file-a", &[placement(1, "N1003", &[])]);
        table.resize_for_node("node1", 1);

        let outcome = table.resize_for_node("node1", 3);
        assert_eq!(outcome.added, vec!["N1001", "N1002"]);
    }

    #[test]
    fn test_assign_release_round_trip() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 2);
        table.resize_for_node("node2", 2);
        let placements = vec![
            placement(1, "N1001", &["N2001"]),
            placement(2, "N2002", &["N1002"]),
        ];

        assert!(table.assign("file-a", &placements));
        assert_eq!(table.get("N1001").unwrap().status, BlockStatus::Occupied);
        assert_eq!(table.get("N2001").unwrap().replica_for, vec!["file-a"]);
        assert_eq!(table.used_by_node("node1"), 2);
        assert_invariants(&table);

        let ids: Vec<String> = placements
            .iter()
            .flat_map(|p| std::iter::once(p.primary_block_id.clone()).chain(p.replica_block_ids.clone()))
            .collect();
        assert!(table.release(&ids));
        for block in table.iter() {
            assert_eq!(block.status, BlockStatus::Free);
            assert!(block.primary_for.is_none());
            assert!(block.replica_for.is_empty());
            assert!(block.path.is_none());
        }
        assert_eq!(table.used_by_node("node1"), 0);
    }

    #[test]
    fn test_assign_unknown_blocks_is_no_change() {
        let mut table = BlockTable::new();
        assert!(!table.assign("file-a", &[placement(1, "N9001", &["N9002"])]));
    }

    #[test]
    fn test_unavailable_round_trip_restores_associations() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 3);
        table.assign("file-a", &[placement(1, "N1001", &["N1002"])]);

        assert!(table.set_unavailable("node1"));
        assert!(table.find_free_by_node().is_empty());
        assert!(!table.set_unavailable("node1"));

        assert!(table.set_available("node1"));
        assert_eq!(table.get("N1001").unwrap().status, BlockStatus::Occupied);
        assert_eq!(table.get("N1002").unwrap().status, BlockStatus::Replica);
        assert_eq!(table.get("N1003").unwrap().status, BlockStatus::Free);
        assert_invariants(&table);
    }

    #[test]
    fn test_find_free_by_node_in_index_order() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 3);
        table.resize_for_node("node2", 1);
        table.assign("file-a", &[placement(1, "N1002", &[])]);

        let free = table.find_free_by_node();
        assert_eq!(free["node1"], vec!["N1001", "N1003"]);
        assert_eq!(free["node2"], vec!["N2001"]);
    }

    #[test]
    fn test_retain_files_clears_dangling_associations() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 2);
        table.assign("gone", &[placement(1, "N1001", &["N1002"])]);

        let kept = BTreeSet::new();
        assert_eq!(table.retain_files(&kept), 2);
        assert!(table.iter().all(|b| b.status == BlockStatus::Free));
        assert_invariants(&table);
    }

    #[test]
    fn test_persisted_shape() {
        let mut table = BlockTable::new();
        table.resize_for_node("node1", 1);
        let value = serde_json::to_value(&table).unwrap();
        assert_eq!(value["table_size"], 1);
        assert_eq!(value["blocks"]["N1001"]["node"], "node1");
        assert_eq!(value["blocks"]["N1001"]["status"], "free");
        assert!(value["blocks"]["N1001"].get("primary_for").is_none());
    }
}
