//! File index: uploaded file id → placement plan
//!
//! Entries only reference blocks and nodes by id; the block table stays
//! authoritative on block status.

use crate::coordinator::placement::Placement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Chunk metadata reported by the uploader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// 1-based, matches `Placement::file_block_index`
    pub index: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: String,
    pub original_filename: String,
    #[serde(default)]
    pub uploader_node: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub total_blocks: u32,
    pub placements: Vec<Placement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkInfo>,
}

impl FileEntry {
    /// Every block id the file holds, primaries and replicas
    pub fn block_ids(&self) -> Vec<String> {
        self.placements
            .iter()
            .flat_map(|p| p.block_ids().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    pub fn is_degraded(&self) -> bool {
        self.placements.iter().any(|p| p.degraded)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileIndex {
    #[serde(default)]
    files: BTreeMap<String, FileEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(files: BTreeMap<String, FileEntry>) -> Self {
        Self { files }
    }

    pub fn insert(&mut self, entry: FileEntry) {
        self.files.insert(entry.file_id.clone(), entry);
    }

    pub fn remove(&mut self, file_id: &str) -> Option<FileEntry> {
        self.files.remove(file_id)
    }

    pub fn get(&self, file_id: &str) -> Option<&FileEntry> {
        self.files.get(file_id)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.files.contains_key(file_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
