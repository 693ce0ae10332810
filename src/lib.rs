//! # miniblock
//!
//! Coordinator for a small distributed block-storage cluster:
//! - Storage nodes register over a persistent TCP connection (or HTTP)
//!   and declare their capacity in 1 MiB blocks
//! - Files are split into blocks that the coordinator places across
//!   nodes with replication
//! - Liveness is tracked with PING/PONG heartbeats; membership changes are
//!   broadcast to every connected node
//! - State survives restarts as JSON snapshots
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!        UDP 5001              TCP 5000                HTTP 8000
//!   DISCOVER_COORDINATOR   REGISTER_NODE / PING    /register /upload ...
//!            │                     │                       │
//!            ▼                     ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Coordinator                          │
//! │  registry ─ block table ─ file index ─ sessions (mpsc)      │
//! │                  │                                          │
//! │             partitioner          health monitor             │
//! └──────────────────┬──────────────────────────────────────────┘
//!                    ▼
//!      nodes_data.json  blocks_data.json  files_data.json
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! miniblock-coord serve \
//!   --node-addr 0.0.0.0:5000 \
//!   --http-addr 0.0.0.0:8000 \
//!   --data-dir ./info \
//!   --replicas 2
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Cluster state
//! miniblock nodes --include-offline
//! miniblock blocks
//!
//! # Place a file
//! miniblock upload ./video.mp4
//!
//! # Free its blocks
//! miniblock delete 3f0c...
//! ```

pub mod client;
pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, CoordinatorServer, UploadRequest};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
