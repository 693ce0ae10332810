//! Metadata snapshots on disk
//!
//! Three independent JSON documents, each rewritten wholesale after a
//! mutation:
//! - `nodes_data.json`  → `{"nodos": {id: NodeInfo}}`
//! - `blocks_data.json` → `{"blocks": {id: Block}, "table_size": n}`
//! - `files_data.json`  → `{"files": {id: FileEntry}}`
//!
//! Loading never fails: a missing, empty or unparsable document is an empty
//! initial state. Writes are best-effort and ordered by generation, so a
//! slow writer can never overwrite a newer snapshot.

use crate::common::Result;
use crate::coordinator::blocks::{Block, BlockTable};
use crate::coordinator::files::{FileEntry, FileIndex};
use crate::coordinator::registry::{NodeInfo, NodeRegistry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const NODES_FILE: &str = "nodes_data.json";
pub const BLOCKS_FILE: &str = "blocks_data.json";
pub const FILES_FILE: &str = "files_data.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodesDocument {
    #[serde(default)]
    nodos: BTreeMap<String, NodeInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlocksDocument {
    #[serde(default)]
    blocks: BTreeMap<String, Block>,
    #[serde(default)]
    table_size: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FilesDocument {
    #[serde(default)]
    files: BTreeMap<String, FileEntry>,
}

/// Which document a snapshot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Nodes,
    Blocks,
    Files,
}

impl SnapshotKind {
    fn file_name(&self) -> &'static str {
        match self {
            SnapshotKind::Nodes => NODES_FILE,
            SnapshotKind::Blocks => BLOCKS_FILE,
            SnapshotKind::Files => FILES_FILE,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Nodes => write!(f, "nodes"),
            SnapshotKind::Blocks => write!(f, "blocks"),
            SnapshotKind::Files => write!(f, "files"),
        }
    }
}

/// Serialized document, taken under the coordinator lock and written after it
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub kind: SnapshotKind,
    pub generation: u64,
    pub bytes: Vec<u8>,
}

impl Snapshot {
    pub fn nodes(generation: u64, registry: &NodeRegistry) -> Result<Self> {
        Ok(Self {
            kind: SnapshotKind::Nodes,
            generation,
            bytes: serde_json::to_vec_pretty(registry)?,
        })
    }

    pub fn blocks(generation: u64, table: &BlockTable) -> Result<Self> {
        Ok(Self {
            kind: SnapshotKind::Blocks,
            generation,
            bytes: serde_json::to_vec_pretty(table)?,
        })
    }

    pub fn files(generation: u64, index: &FileIndex) -> Result<Self> {
        Ok(Self {
            kind: SnapshotKind::Files,
            generation,
            bytes: serde_json::to_vec_pretty(index)?,
        })
    }
}

struct SnapshotFile {
    path: PathBuf,
    /// Generation of the last snapshot written
    written: Mutex<u64>,
}

impl SnapshotFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Mutex::new(0),
        }
    }

    /// Returns false if a newer snapshot was already written.
    fn write(&self, generation: u64, bytes: &[u8]) -> Result<bool> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if generation <= *written {
            return Ok(false);
        }
        write_atomic(&self.path, bytes)?;
        *written = generation;
        Ok(true)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// State recovered at startup
#[derive(Debug, Default)]
pub struct LoadedState {
    pub registry: NodeRegistry,
    pub blocks: BlockTable,
    pub files: FileIndex,
}

/// Snapshot store rooted at a data directory
pub struct MetadataStore {
    dir: PathBuf,
    nodes: SnapshotFile,
    blocks: SnapshotFile,
    files: SnapshotFile,
}

impl MetadataStore {
    /// Open or create the data directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            nodes: SnapshotFile::new(dir.join(NODES_FILE)),
            blocks: SnapshotFile::new(dir.join(BLOCKS_FILE)),
            files: SnapshotFile::new(dir.join(FILES_FILE)),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load all three documents, falling back to empty state per document.
    pub fn load(&self) -> LoadedState {
        let nodes: NodesDocument = load_document(&self.nodes.path);
        let blocks: BlocksDocument = load_document(&self.blocks.path);
        let files: FilesDocument = load_document(&self.files.path);

        if blocks.table_size != blocks.blocks.len() {
            tracing::debug!(
                recorded = blocks.table_size,
                actual = blocks.blocks.len(),
                "block table size mismatch in snapshot"
            );
        }

        LoadedState {
            registry: NodeRegistry::from_records(nodes.nodos),
            blocks: BlockTable::from_blocks(blocks.blocks),
            files: FileIndex::from_entries(files.files),
        }
    }

    /// Best-effort write. Failures are logged; memory stays authoritative.
    pub fn persist(&self, snapshot: &Snapshot) {
        let file = match snapshot.kind {
            SnapshotKind::Nodes => &self.nodes,
            SnapshotKind::Blocks => &self.blocks,
            SnapshotKind::Files => &self.files,
        };
        match file.write(snapshot.generation, &snapshot.bytes) {
            Ok(true) => tracing::debug!(
                kind = %snapshot.kind,
                generation = snapshot.generation,
                "snapshot written"
            ),
            Ok(false) => tracing::trace!(
                kind = %snapshot.kind,
                generation = snapshot.generation,
                "stale snapshot skipped"
            ),
            Err(e) => tracing::warn!(
                kind = %snapshot.kind,
                path = %file.path.display(),
                error = %e,
                "failed to persist snapshot"
            ),
        }
    }

    /// Rewrite all documents to their empty form.
    pub fn reset(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for kind in [SnapshotKind::Nodes, SnapshotKind::Blocks, SnapshotKind::Files] {
            let path = dir.join(kind.file_name());
            let bytes = match kind {
                SnapshotKind::Nodes => serde_json::to_vec_pretty(&NodesDocument::default())?,
                SnapshotKind::Blocks => serde_json::to_vec_pretty(&BlocksDocument::default())?,
                SnapshotKind::Files => serde_json::to_vec_pretty(&FilesDocument::default())?,
            };
            write_atomic(&path, &bytes)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn load_document<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable snapshot, starting empty");
            return T::default();
        }
    };
    if contents.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str(&contents) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupted snapshot, starting empty");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_files_load_empty() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        let state = store.load();
        assert!(state.registry.is_empty());
        assert!(state.blocks.is_empty());
        assert!(state.files.is_empty());
    }

    #[test]
    fn test_empty_and_truncated_files_load_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(NODES_FILE), "   \n").unwrap();
        fs::write(dir.path().join(BLOCKS_FILE), "{\"blocks\": {\"N1001\": {\"id\"").unwrap();
        fs::write(dir.path().join(FILES_FILE), "{}").unwrap();

        let store = MetadataStore::open(dir.path()).unwrap();
        let state = store.load();
        assert!(state.registry.is_empty());
        assert!(state.blocks.is_empty());
        assert!(state.files.is_empty());
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();

        let mut registry = NodeRegistry::new();
        let id = registry.register("10.0.0.1", 3).node_id;
        let mut table = BlockTable::new();
        table.resize_for_node(&id, 3);

        store.persist(&Snapshot::nodes(1, &registry).unwrap());
        store.persist(&Snapshot::blocks(2, &table).unwrap());

        let state = MetadataStore::open(dir.path()).unwrap().load();
        assert_eq!(state.registry.get(&id).unwrap().id, id);
        assert_eq!(state.blocks.blocks_of(&id).count(), 3);
        assert_eq!(state.blocks.table_size(), 3);
    }

    #[test]
    fn test_stale_generation_is_skipped() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();

        let mut registry = NodeRegistry::new();
        registry.register("10.0.0.1", 1);
        let older = Snapshot::nodes(1, &registry).unwrap();
        registry.register("10.0.0.2", 1);
        let newer = Snapshot::nodes(2, &registry).unwrap();

        store.persist(&newer);
        store.persist(&older);

        let state = store.load();
        assert_eq!(state.registry.len(), 2);
    }

    #[test]
    fn test_reset_writes_empty_documents() {
        let dir = tempdir().unwrap();
        let written = MetadataStore::reset(dir.path()).unwrap();
        assert_eq!(written.len(), 3);

        let nodes: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(NODES_FILE)).unwrap()).unwrap();
        assert_eq!(nodes, serde_json::json!({ "nodos": {} }));
        let blocks: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(BLOCKS_FILE)).unwrap()).unwrap();
        assert_eq!(blocks, serde_json::json!({ "blocks": {}, "table_size": 0 }));
    }
}
