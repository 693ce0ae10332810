//! HTTP API for the coordinator
//!
//! Registration and heartbeats for nodes without a socket, uploads and
//! deletes for clients, and a read-only query surface. All handlers go
//! through the shared [`Coordinator`].

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::coordinator::discovery::{Advertised, DiscoveryReply};
use crate::coordinator::files::ChunkInfo;
use crate::coordinator::state::{Coordinator, UploadRequest};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Upload bodies carry chunk metadata only, never payload.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub coordinator: Arc<Coordinator>,
    pub advertised: Advertised,
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/discover", get(discover))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/upload", post(upload))
        .route("/nodes", get(list_nodes))
        .route("/blocks", get(list_blocks))
        .route("/files", get(list_files))
        .route("/files/:file_id", get(get_file).delete(delete_file))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Source address of the request; loopback when served without connect info
fn client_ip(connect: Option<ConnectInfo<SocketAddr>>) -> IpAddr {
    connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn health(State(state): State<CoordState>) -> Json<Value> {
    let coordinator = &state.coordinator;
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes_online": coordinator.nodes(false).len(),
        "nodes_connected": coordinator.connected_nodes().len(),
        "files": coordinator.files().len(),
        "replication": coordinator.replication(),
    }))
}

async fn discover(
    State(state): State<CoordState>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Json<DiscoveryReply> {
    let ip = client_ip(connect).to_string();
    Json(state.advertised.reply_for(&state.coordinator, &ip))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    capacity: u32,
    #[serde(default)]
    port: Option<u16>,
}

async fn register(
    State(state): State<CoordState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>> {
    let ip = client_ip(connect).to_string();
    let registration = match request.node_id.as_deref().map(str::trim) {
        Some("") => return Err(Error::InvalidRequest("node_id must not be empty".into())),
        Some(node_id) => {
            state
                .coordinator
                .register_as(node_id, &ip, request.port, Some(request.capacity))
        }
        None => state.coordinator.register(&ip, request.capacity),
    };

    tracing::info!(
        node_id = %registration.node_id,
        %ip,
        capacity = request.capacity,
        created = registration.created,
        "node registered over HTTP"
    );

    Ok(Json(json!({
        "status": "OK",
        "node_id": registration.node_id,
    })))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    node_id: String,
}

async fn heartbeat(
    State(state): State<CoordState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<Value>> {
    state.coordinator.heartbeat(&request.node_id)?;
    Ok(Json(json!({ "status": "OK" })))
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    filename: String,
    #[serde(default)]
    uploader: Option<String>,
    total_blocks: u32,
    #[serde(default)]
    chunks: Vec<ChunkInfo>,
}

async fn upload(
    State(state): State<CoordState>,
    Json(body): Json<UploadBody>,
) -> Result<Json<Value>> {
    let entry = state.coordinator.upload(UploadRequest {
        filename: body.filename,
        uploader: body.uploader,
        total_blocks: body.total_blocks,
        chunks: body.chunks,
    })?;

    Ok(Json(json!({
        "status": "OK",
        "file_id": entry.file_id,
        "degraded": entry.is_degraded(),
        "placements": entry.placements,
    })))
}

async fn delete_file(
    State(state): State<CoordState>,
    Path(file_id): Path<String>,
) -> Result<Json<Value>> {
    let entry = state.coordinator.delete_file(&file_id)?;
    tracing::info!(file_id = %entry.file_id, blocks = entry.total_blocks, "file deleted");
    Ok(Json(json!({
        "status": "OK",
        "file_id": entry.file_id,
        "released_blocks": entry.block_ids().len(),
    })))
}

#[derive(Debug, Deserialize)]
struct NodesQuery {
    #[serde(default = "default_include_offline")]
    include_offline: bool,
}

fn default_include_offline() -> bool {
    true
}

async fn list_nodes(State(state): State<CoordState>, Query(query): Query<NodesQuery>) -> Json<Value> {
    let nodes = state.coordinator.nodes(query.include_offline);
    Json(json!({ "nodes": nodes }))
}

async fn list_blocks(State(state): State<CoordState>) -> Json<Value> {
    let (blocks, table_size) = state.coordinator.blocks();
    Json(json!({ "blocks": blocks, "table_size": table_size }))
}

async fn list_files(State(state): State<CoordState>) -> Json<Value> {
    Json(json!({ "files": state.coordinator.files() }))
}

async fn get_file(
    State(state): State<CoordState>,
    Path(file_id): Path<String>,
) -> Result<Json<Value>> {
    let entry = state
        .coordinator
        .file(&file_id)
        .ok_or(Error::FileNotFound(file_id))?;
    Ok(Json(json!(entry)))
}
