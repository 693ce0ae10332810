//! Coordinator aggregate
//!
//! Owns the node registry, block table, file index and live session map
//! behind one coarse lock. Everything else (session tasks, the health
//! monitor, HTTP handlers, discovery) goes through these methods.
//!
//! The lock is a `std::sync::Mutex` and is never held across an `.await`.
//! Outbound frames are handed to session queues with `try_send`, so holding
//! the lock never waits on a peer. Snapshots are serialized under the lock
//! and written to disk after it is released.

use crate::common::{timestamp_now, CoordinatorConfig, Error, Result};
use crate::coordinator::blocks::{Block, BlockTable};
use crate::coordinator::files::{ChunkInfo, FileEntry, FileIndex};
use crate::coordinator::metadata::{LoadedState, MetadataStore, Snapshot};
use crate::coordinator::placement::{Partitioner, Placement};
use crate::coordinator::protocol::CoordinatorMessage;
use crate::coordinator::registry::{NodeInfo, NodeRegistry, Registration};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one connection; a reconnecting node gets a new one.
pub type SessionId = u64;

/// How often an upload recomputes placements after losing a race
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

struct Session {
    id: SessionId,
    tx: mpsc::Sender<CoordinatorMessage>,
    last_pong: Instant,
}

#[derive(Default)]
struct State {
    registry: NodeRegistry,
    blocks: BlockTable,
    files: FileIndex,
    sessions: HashMap<String, Session>,
    generation: u64,
}

/// Which documents a mutation touched
#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    nodes: bool,
    blocks: bool,
    files: bool,
}

impl Dirty {
    fn all() -> Self {
        Self {
            nodes: true,
            blocks: true,
            files: true,
        }
    }
}

/// Collaborator-provided description of a split file
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub filename: String,
    pub uploader: Option<String>,
    pub total_blocks: u32,
    pub chunks: Vec<ChunkInfo>,
}

/// Result of binding a connection to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub node_id: String,
    pub session_id: SessionId,
}

pub struct Coordinator {
    state: Mutex<State>,
    store: Option<MetadataStore>,
    partitioner: Partitioner,
    next_session: AtomicU64,
}

impl Coordinator {
    /// Open the snapshot store in `config.data_dir`, load and reconcile.
    pub fn open(config: &CoordinatorConfig) -> Result<Self> {
        let store = MetadataStore::open(&config.data_dir)?;
        let loaded = store.load();
        tracing::info!(
            nodes = loaded.registry.len(),
            blocks = loaded.blocks.len(),
            files = loaded.files.len(),
            dir = %store.dir().display(),
            "loaded snapshots"
        );
        let coordinator = Self::from_loaded(loaded, Some(store), config.replicas);
        coordinator.persist_all();
        Ok(coordinator)
    }

    /// Coordinator without persistence
    pub fn in_memory(replicas: usize) -> Self {
        Self::from_loaded(LoadedState::default(), None, replicas)
    }

    fn from_loaded(loaded: LoadedState, store: Option<MetadataStore>, replicas: usize) -> Self {
        let mut state = State {
            registry: loaded.registry,
            blocks: loaded.blocks,
            files: loaded.files,
            sessions: HashMap::new(),
            generation: 0,
        };
        reconcile(&mut state);
        Self {
            state: Mutex::new(state),
            store,
            partitioner: Partitioner::new(replicas),
            next_session: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replication(&self) -> usize {
        self.partitioner.replication()
    }

    // === Registration ===

    /// Register by source address (HTTP without a node id).
    pub fn register(&self, ip: &str, capacity: u32) -> Registration {
        self.mutate(|state, dirty| {
            let registration = state.registry.register(ip, capacity);
            node_came_online(state, &registration.node_id, dirty);
            registration
        })
    }

    /// Register under a known id (HTTP with a node id).
    pub fn register_as(
        &self,
        node_id: &str,
        ip: &str,
        port: Option<u16>,
        capacity: Option<u32>,
    ) -> Registration {
        self.mutate(|state, dirty| {
            let registration = state.registry.register_as(node_id, ip, port, capacity);
            node_came_online(state, &registration.node_id, dirty);
            registration
        })
    }

    /// Discovery: id for a source address, without creating a record.
    pub fn reserve_node_id(&self, ip: &str) -> String {
        self.lock().registry.reserve(ip)
    }

    /// Liveness refresh for nodes without a socket.
    pub fn heartbeat(&self, node_id: &str) -> Result<()> {
        self.mutate(|state, dirty| {
            if !state.registry.touch(node_id) {
                return Err(Error::NodeNotFound(node_id.to_string()));
            }
            if !state.registry.is_online(node_id) {
                state.registry.mark_online(node_id);
                node_came_online(state, node_id, dirty);
            }
            Ok(())
        })
    }

    // === Sessions ===

    /// Bind a connection to a node and announce it to everyone else.
    ///
    /// A previous session of the same node is replaced; dropping its queue
    /// makes its task close the old socket.
    pub fn attach_session(
        &self,
        node_id: Option<&str>,
        ip: &str,
        port: Option<u16>,
        capacity: Option<u32>,
        tx: mpsc::Sender<CoordinatorMessage>,
    ) -> Attached {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.mutate(|state, dirty| {
            let node_id = match node_id {
                Some(id) => id.to_string(),
                None => state.registry.reserve(ip),
            };
            state.registry.register_as(&node_id, ip, port, capacity);
            let replaced = state.sessions.insert(
                node_id.clone(),
                Session {
                    id: session_id,
                    tx,
                    last_pong: Instant::now(),
                },
            );
            if replaced.is_some() {
                tracing::info!(node_id = %node_id, "replaced previous session");
            }
            node_came_online(state, &node_id, dirty);
            Attached {
                node_id,
                session_id,
            }
        })
    }

    /// Tear down a session (graceful `DISCONNECT`, EOF or transport error).
    ///
    /// No-op if the node has since reconnected under a newer session.
    pub fn detach_session(&self, node_id: &str, session_id: SessionId) -> bool {
        self.mutate(|state, dirty| {
            let current = state.sessions.get(node_id).map(|s| s.id);
            if current != Some(session_id) {
                return false;
            }
            drop_node(state, node_id, dirty);
            broadcast_locked(
                state,
                CoordinatorMessage::NodeDisconnected {
                    node_id: node_id.to_string(),
                },
                Some(node_id),
                dirty,
            );
            true
        })
    }

    pub fn record_pong(&self, node_id: &str) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(node_id) {
            session.last_pong = Instant::now();
        }
        state.registry.touch(node_id);
    }

    /// Known node ids except `caller`
    pub fn peer_ids(&self, caller: Option<&str>) -> Vec<String> {
        self.lock()
            .registry
            .ids()
            .filter(|id| Some(*id) != caller)
            .map(str::to_string)
            .collect()
    }

    /// Forward a node-to-node message to the target's live connection.
    pub fn forward(&self, from: &str, to: &str, content: &str) -> Result<()> {
        self.mutate(|state, dirty| {
            let Some(session) = state.sessions.get(to) else {
                return Err(Error::NotConnected(to.to_string()));
            };
            let message = CoordinatorMessage::ReceiveMessage {
                from: from.to_string(),
                content: content.to_string(),
            };
            if let Err(e) = session.tx.try_send(message) {
                tracing::warn!(node_id = to, error = %e, "forward failed, dropping session");
                drop_node(state, to, dirty);
                broadcast_locked(
                    state,
                    CoordinatorMessage::NodeDisconnected {
                        node_id: to.to_string(),
                    },
                    Some(to),
                    dirty,
                );
                return Err(Error::NotConnected(to.to_string()));
            }
            Ok(())
        })
    }

    /// Best-effort delivery to every live session except `exclude`.
    pub fn broadcast(&self, event: CoordinatorMessage, exclude: Option<&str>) {
        self.mutate(|state, dirty| broadcast_locked(state, event, exclude, dirty))
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.lock().sessions.contains_key(node_id)
    }

    // === Health ===

    /// Queue a `PING` on every session; returns nodes whose queue refused it.
    pub fn ping_all(&self) -> Vec<String> {
        let state = self.lock();
        state
            .sessions
            .iter()
            .filter(|(_, session)| session.tx.try_send(CoordinatorMessage::Ping).is_err())
            .map(|(node_id, _)| node_id.clone())
            .collect()
    }

    /// Nodes whose heartbeat is older than `timeout`.
    ///
    /// Connected nodes are judged by their last `PONG`; online nodes
    /// without a socket by `last_seen`.
    pub fn stale_nodes(&self, now: Instant, wall_now: DateTime<Utc>, timeout: Duration) -> BTreeSet<String> {
        let state = self.lock();
        let mut stale = BTreeSet::new();

        for (node_id, session) in &state.sessions {
            if now.saturating_duration_since(session.last_pong) > timeout {
                stale.insert(node_id.clone());
            }
        }

        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        for info in state.registry.iter() {
            if info.status.is_online()
                && !state.sessions.contains_key(&info.id)
                && wall_now.signed_duration_since(info.last_seen) > timeout
            {
                stale.insert(info.id.clone());
            }
        }
        stale
    }

    /// Drop sessions, mark offline and announce each node once.
    pub fn expire(&self, nodes: &BTreeSet<String>) -> Vec<String> {
        self.mutate(|state, dirty| {
            let mut expired = Vec::new();
            for node_id in nodes {
                if drop_node(state, node_id, dirty) {
                    expired.push(node_id.clone());
                }
            }
            for node_id in &expired {
                broadcast_locked(
                    state,
                    CoordinatorMessage::NodeDisconnected {
                        node_id: node_id.clone(),
                    },
                    Some(node_id),
                    dirty,
                );
            }
            expired
        })
    }

    // === Files ===

    /// Place a file's blocks and record it.
    ///
    /// Placement runs against a snapshot outside the lock, then is
    /// re-validated and applied under it. Nothing is applied on failure.
    pub fn upload(&self, request: UploadRequest) -> Result<FileEntry> {
        validate_upload(&request)?;
        let file_id = Uuid::new_v4().to_string();

        for attempt in 1..=MAX_PLACEMENT_ATTEMPTS {
            let (nodes, free) = {
                let state = self.lock();
                (state.registry.snapshot(), state.blocks.find_free_by_node())
            };

            let placements = self
                .partitioner
                .allocate_from_free(request.total_blocks, &nodes, &free)?;

            let applied = self.mutate(|state, dirty| {
                if !still_valid(state, &placements) {
                    return None;
                }
                Some(apply_upload(state, &file_id, &request, placements.clone(), dirty))
            });

            match applied {
                Some(entry) => {
                    tracing::info!(
                        file_id = %entry.file_id,
                        filename = %entry.original_filename,
                        blocks = entry.total_blocks,
                        degraded = entry.is_degraded(),
                        "file placed"
                    );
                    return Ok(entry);
                }
                None => tracing::debug!(attempt, "placement invalidated by a concurrent change, retrying"),
            }
        }

        Err(Error::Conflict(
            "cluster changed while placing blocks; retry the upload".to_string(),
        ))
    }

    /// Remove a file and free its blocks.
    pub fn delete_file(&self, file_id: &str) -> Result<FileEntry> {
        self.mutate(|state, dirty| {
            let entry = state
                .files
                .remove(file_id)
                .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;
            let block_ids = entry.block_ids();
            state.blocks.release(&block_ids);
            let nodes: BTreeSet<String> = entry
                .placements
                .iter()
                .flat_map(|p| std::iter::once(p.primary_node.clone()).chain(p.replica_nodes.clone()))
                .collect();
            refresh_used(state, nodes.iter().map(String::as_str));
            dirty.blocks = true;
            dirty.files = true;
            dirty.nodes = true;
            Ok(entry)
        })
    }

    // === Queries ===

    pub fn nodes(&self, include_offline: bool) -> Vec<NodeInfo> {
        self.lock()
            .registry
            .iter()
            .filter(|info| include_offline || info.status.is_online())
            .cloned()
            .collect()
    }

    pub fn node(&self, node_id: &str) -> Option<NodeInfo> {
        self.lock().registry.get(node_id).cloned()
    }

    pub fn registry_snapshot(&self) -> BTreeMap<String, NodeInfo> {
        self.lock().registry.snapshot()
    }

    /// Blocks and the table size
    pub fn blocks(&self) -> (Vec<Block>, usize) {
        let state = self.lock();
        (state.blocks.iter().cloned().collect(), state.blocks.table_size())
    }

    pub fn block_table(&self) -> BlockTable {
        self.lock().blocks.clone()
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.lock().files.iter().cloned().collect()
    }

    pub fn file(&self, file_id: &str) -> Option<FileEntry> {
        self.lock().files.get(file_id).cloned()
    }

    // === Plumbing ===

    fn mutate<R>(&self, f: impl FnOnce(&mut State, &mut Dirty) -> R) -> R {
        let mut dirty = Dirty::default();
        let (result, snapshots) = {
            let mut state = self.lock();
            let result = f(&mut state, &mut dirty);
            let snapshots = self.take_snapshots(&mut state, dirty);
            (result, snapshots)
        };
        self.write(&snapshots);
        result
    }

    fn persist_all(&self) {
        let snapshots = {
            let mut state = self.lock();
            self.take_snapshots(&mut state, Dirty::all())
        };
        self.write(&snapshots);
    }

    fn take_snapshots(&self, state: &mut State, dirty: Dirty) -> Vec<Snapshot> {
        if self.store.is_none() {
            return Vec::new();
        }
        let mut results = Vec::new();
        if dirty.nodes {
            state.generation += 1;
            results.push(Snapshot::nodes(state.generation, &state.registry));
        }
        if dirty.blocks {
            state.generation += 1;
            results.push(Snapshot::blocks(state.generation, &state.blocks));
        }
        if dirty.files {
            state.generation += 1;
            results.push(Snapshot::files(state.generation, &state.files));
        }
        results
            .into_iter()
            .filter_map(|result| {
                result
                    .map_err(|e| tracing::warn!(error = %e, "failed to serialize snapshot"))
                    .ok()
            })
            .collect()
    }

    fn write(&self, snapshots: &[Snapshot]) {
        if let Some(store) = &self.store {
            for snapshot in snapshots {
                store.persist(snapshot);
            }
        }
    }
}

/// Startup repair: nothing is connected yet, and the three snapshots may
/// disagree after a crash between writes.
fn reconcile(state: &mut State) {
    let went_offline = state.registry.mark_all_offline();
    if !went_offline.is_empty() {
        tracing::info!(nodes = ?went_offline, "marked nodes offline until they reconnect");
    }

    let files: BTreeSet<String> = state.files.ids().cloned().collect();
    let cleared = state.blocks.retain_files(&files);
    if cleared > 0 {
        tracing::warn!(cleared, "cleared block associations to missing files");
    }

    let known: BTreeSet<String> = state.registry.ids().map(str::to_string).collect();
    let dropped = state.blocks.retain_known_nodes(&known);
    if dropped > 0 {
        tracing::warn!(dropped, "dropped blocks of unknown nodes");
    }

    let nodes: Vec<(String, u32)> = state
        .registry
        .iter()
        .map(|info| (info.id.clone(), info.capacity))
        .collect();
    for (node_id, capacity) in &nodes {
        state.blocks.resize_for_node(node_id, *capacity);
        state.blocks.set_unavailable(node_id);
    }
    refresh_used(state, nodes.iter().map(|(id, _)| id.as_str()));
}

/// Resize to the recorded capacity and reopen the node's blocks.
fn node_came_online(state: &mut State, node_id: &str, dirty: &mut Dirty) {
    let capacity = state.registry.get(node_id).map(|info| info.capacity).unwrap_or(0);
    let outcome = state.blocks.resize_for_node(node_id, capacity);
    if outcome.changed() {
        tracing::info!(
            node_id,
            capacity,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "resized block table"
        );
    }
    state.blocks.set_available(node_id);
    refresh_used(state, std::iter::once(node_id));

    let (ip, port) = state
        .registry
        .get(node_id)
        .map(|info| (info.ip.clone(), info.port))
        .unwrap_or_default();
    dirty.nodes = true;
    dirty.blocks = true;

    tracing::info!(node_id, %ip, port, "node online");
    broadcast_locked(
        state,
        CoordinatorMessage::NodeConnected {
            node_id: node_id.to_string(),
            ip,
            port,
        },
        Some(node_id),
        dirty,
    );
}

/// Remove the session (if any) and mark the node offline.
/// Returns true if anything changed.
fn drop_node(state: &mut State, node_id: &str, dirty: &mut Dirty) -> bool {
    let had_session = state.sessions.remove(node_id).is_some();
    let went_offline = state.registry.mark_offline(node_id);
    if had_session || went_offline {
        state.blocks.set_unavailable(node_id);
        dirty.nodes = true;
        dirty.blocks = true;
        tracing::info!(node_id, had_session, "node offline");
        true
    } else {
        false
    }
}

/// Deliver to every session but `exclude`; peers that cannot take the
/// frame are dropped after the pass, and their departure is announced in
/// turn.
fn broadcast_locked(
    state: &mut State,
    event: CoordinatorMessage,
    exclude: Option<&str>,
    dirty: &mut Dirty,
) {
    let mut queue = VecDeque::from([(event, exclude.map(str::to_string))]);

    while let Some((event, exclude)) = queue.pop_front() {
        let targets: Vec<(String, mpsc::Sender<CoordinatorMessage>)> = state
            .sessions
            .iter()
            .filter(|(node_id, _)| Some(node_id.as_str()) != exclude.as_deref())
            .map(|(node_id, session)| (node_id.clone(), session.tx.clone()))
            .collect();

        let mut failed = Vec::new();
        for (node_id, tx) in targets {
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::warn!(node_id = %node_id, error = %e, "broadcast failed, dropping session");
                failed.push(node_id);
            }
        }

        for node_id in failed {
            if drop_node(state, &node_id, dirty) {
                queue.push_back((
                    CoordinatorMessage::NodeDisconnected {
                        node_id: node_id.clone(),
                    },
                    Some(node_id),
                ));
            }
        }
    }
}

fn refresh_used<'a>(state: &mut State, nodes: impl Iterator<Item = &'a str>) {
    for node_id in nodes {
        let used = state.blocks.used_by_node(node_id);
        state.registry.set_used(node_id, used);
    }
}

fn validate_upload(request: &UploadRequest) -> Result<()> {
    if request.filename.trim().is_empty() {
        return Err(Error::InvalidRequest("filename is required".to_string()));
    }
    if request.total_blocks == 0 {
        return Err(Error::InvalidRequest("file has no blocks".to_string()));
    }
    if let Some(chunk) = request
        .chunks
        .iter()
        .find(|c| c.index == 0 || c.index > request.total_blocks)
    {
        return Err(Error::InvalidRequest(format!(
            "chunk index {} outside 1..={}",
            chunk.index, request.total_blocks
        )));
    }
    Ok(())
}

/// Every chosen block is still free on a node that is still online.
fn still_valid(state: &State, placements: &[Placement]) -> bool {
    placements.iter().all(|p| {
        state.registry.is_online(&p.primary_node)
            && state.blocks.is_free_on(&p.primary_block_id, &p.primary_node)
            && p.replica_block_ids
                .iter()
                .zip(&p.replica_nodes)
                .all(|(block, node)| state.registry.is_online(node) && state.blocks.is_free_on(block, node))
    })
}

fn apply_upload(
    state: &mut State,
    file_id: &str,
    request: &UploadRequest,
    placements: Vec<Placement>,
    dirty: &mut Dirty,
) -> FileEntry {
    state.blocks.assign(file_id, &placements);

    for chunk in &request.chunks {
        let Some(path) = &chunk.path else { continue };
        if let Some(placement) = placements.iter().find(|p| p.file_block_index == chunk.index) {
            state.blocks.set_path(&placement.primary_block_id, path.clone());
        }
    }

    let nodes: BTreeSet<&str> = placements
        .iter()
        .flat_map(|p| std::iter::once(p.primary_node.as_str()).chain(p.replica_nodes.iter().map(String::as_str)))
        .collect();
    refresh_used(state, nodes.into_iter());

    let entry = FileEntry {
        file_id: file_id.to_string(),
        original_filename: request.filename.clone(),
        uploader_node: request.uploader.clone(),
        uploaded_at: timestamp_now(),
        total_blocks: request.total_blocks,
        placements,
        chunks: request.chunks.clone(),
    };
    state.files.insert(entry.clone());

    dirty.nodes = true;
    dirty.blocks = true;
    dirty.files = true;
    entry
}
