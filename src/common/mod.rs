//! Common utilities and types shared across miniblock

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, CoordinatorConfig};
pub use error::{Error, Result};
pub use utils::{
    blocks_for_size, format_bytes, local_ip, node_id_for, node_number, timestamp_now, NodeStatus,
    BLOCK_SIZE,
};
