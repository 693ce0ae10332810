//! Coordinator implementation
//!
//! The coordinator is responsible for:
//! - Node identity and liveness (registry + health monitor)
//! - The global block table, sized from declared capacities
//! - Placement of file blocks with replication (partitioner)
//! - The persistent node protocol and its broadcasts (sessions)
//! - Best-effort JSON snapshots of its state

pub mod blocks;
pub mod discovery;
pub mod files;
pub mod health;
pub mod http;
pub mod metadata;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

pub use server::CoordinatorServer;
pub use state::{Coordinator, UploadRequest};
