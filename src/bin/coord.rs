//! Coordinator binary

use clap::{Parser, Subcommand};
use miniblock::common::config::Config;
use miniblock::coordinator::metadata::MetadataStore;
use miniblock::CoordinatorServer;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniblock-coord")]
#[command(about = "miniblock storage coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Bind address for node connections
        #[arg(long)]
        node_addr: Option<SocketAddr>,

        /// Bind address for the HTTP API
        #[arg(long)]
        http_addr: Option<SocketAddr>,

        /// Bind address for UDP discovery
        #[arg(long)]
        discovery_addr: Option<SocketAddr>,

        /// IP handed to nodes in discovery replies
        #[arg(long)]
        advertise_ip: Option<IpAddr>,

        /// Snapshot directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Replication factor
        #[arg(long)]
        replicas: Option<usize>,

        /// Heartbeat interval in milliseconds
        #[arg(long)]
        heartbeat_interval_ms: Option<u64>,
    },

    /// Reset persisted metadata to an empty cluster
    Reset {
        /// Snapshot directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // File and environment first, CLI flags on top
    let config = Config::load()?;
    init_tracing(&config.log_level);
    let mut coord_config = config.coordinator;

    match cli.command {
        Commands::Serve {
            node_addr,
            http_addr,
            discovery_addr,
            advertise_ip,
            data_dir,
            replicas,
            heartbeat_interval_ms,
        } => {
            if let Some(addr) = node_addr {
                coord_config.node_addr = addr;
            }
            if let Some(addr) = http_addr {
                coord_config.http_addr = addr;
            }
            if let Some(addr) = discovery_addr {
                coord_config.discovery_addr = addr;
            }
            if advertise_ip.is_some() {
                coord_config.advertise_ip = advertise_ip;
            }
            if let Some(dir) = data_dir {
                coord_config.data_dir = dir;
            }
            if let Some(replicas) = replicas {
                coord_config.replicas = replicas;
            }
            if let Some(interval) = heartbeat_interval_ms {
                coord_config.heartbeat_interval_ms = interval;
            }

            let server = CoordinatorServer::bind(coord_config).await?;
            server.serve().await?;
        }

        Commands::Reset { data_dir, yes } => {
            let dir = data_dir.unwrap_or(coord_config.data_dir);
            if !yes && !confirm(&format!("Erase all cluster metadata in {}?", dir.display()))? {
                println!("Aborted.");
                return Ok(());
            }
            for path in MetadataStore::reset(&dir)? {
                println!("✓ Reset {}", path.display());
            }
        }
    }

    Ok(())
}
