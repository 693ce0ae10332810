//! Configuration for the miniblock coordinator
//!
//! Values are layered: built-in defaults, then an optional `miniblock.toml`,
//! then `MINIBLOCK__*` environment variables. The binaries apply CLI flags on top.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default configuration file name (extension resolved by the `config` crate)
pub const CONFIG_FILE: &str = "miniblock";

/// Environment variable prefix, e.g. `MINIBLOCK__COORDINATOR__REPLICAS=3`
pub const ENV_PREFIX: &str = "MINIBLOCK";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load() -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.coordinator.validate()?;
        Ok(config)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for persistent node connections
    #[serde(default = "default_node_addr")]
    pub node_addr: SocketAddr,

    /// Bind address for the HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Bind address for the UDP discovery responder
    #[serde(default = "default_discovery_addr")]
    pub discovery_addr: SocketAddr,

    /// IP announced to nodes in discovery replies (auto-detected if unset)
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,

    /// Directory holding the JSON snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Replication factor (primary included)
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Health monitor period
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Lower bound for the heartbeat timeout
    #[serde(default = "default_heartbeat_timeout_floor")]
    pub heartbeat_timeout_floor_ms: u64,

    /// Per-frame socket write deadline
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Outbound frames buffered per session before the peer counts as stalled
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Longest inbound line accepted from a node; longer ones are discarded
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_node_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}
fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}
fn default_discovery_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5001))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./info")
}
fn default_replicas() -> usize {
    2
}
fn default_heartbeat_interval() -> u64 {
    5_000
}
fn default_heartbeat_timeout_floor() -> u64 {
    10_000
}
fn default_send_timeout() -> u64 {
    2_000
}
fn default_outbound_queue() -> usize {
    64
}
fn default_max_frame_bytes() -> usize {
    crate::coordinator::protocol::DEFAULT_MAX_FRAME_BYTES
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_addr: default_node_addr(),
            http_addr: default_http_addr(),
            discovery_addr: default_discovery_addr(),
            advertise_ip: None,
            data_dir: default_data_dir(),
            replicas: default_replicas(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_floor_ms: default_heartbeat_timeout_floor(),
            send_timeout_ms: default_send_timeout(),
            outbound_queue: default_outbound_queue(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.replicas < 1 {
            return Err(crate::Error::InvalidConfig(
                "replicas must be >= 1".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(crate::Error::InvalidConfig(
                "outbound_queue must be > 0".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_frame_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// max(floor, 3 × interval)
    pub fn heartbeat_timeout(&self) -> Duration {
        let floor = Duration::from_millis(self.heartbeat_timeout_floor_ms);
        floor.max(self.heartbeat_interval() * 3)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
