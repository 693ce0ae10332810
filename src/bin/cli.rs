//! CLI for cluster operations

use clap::{Parser, Subcommand};
use miniblock::client::ApiClient;
use miniblock::common::format_bytes;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "miniblock")]
#[command(about = "miniblock cluster CLI")]
#[command(version)]
struct Cli {
    /// Coordinator HTTP URL
    #[arg(long, default_value = "http://localhost:8000")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nodes
    Nodes {
        /// Include offline nodes
        #[arg(long)]
        include_offline: bool,
    },

    /// Show the block table
    Blocks,

    /// List uploaded files
    Files,

    /// Register a node by HTTP
    Register {
        /// Capacity in 1 MiB blocks
        #[arg(long)]
        capacity: u32,

        /// Node id obtained from discovery
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Place a local file's blocks
    Upload {
        /// File path
        file: PathBuf,

        /// Uploading node id
        #[arg(long)]
        uploader: Option<String>,
    },

    /// Delete a file and free its blocks
    Delete {
        /// File id
        file_id: String,
    },
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn items<'a>(value: &'a Value, key: &str) -> Vec<&'a Value> {
    match value.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.coordinator)?;

    match cli.command {
        Commands::Nodes { include_offline } => {
            let response = client.nodes(include_offline).await?;
            println!("{:<10} {:<16} {:>6} {:>9} {:>6}  status", "id", "ip", "port", "capacity", "used");
            for node in items(&response, "nodes") {
                println!(
                    "{:<10} {:<16} {:>6} {:>9} {:>6}  {}",
                    str_field(node, "id"),
                    str_field(node, "ip"),
                    node["port"],
                    node["capacity"],
                    node["used"],
                    str_field(node, "status"),
                );
            }
        }

        Commands::Blocks => {
            let response = client.blocks().await?;
            println!("Block table ({} blocks):", response["table_size"]);
            for block in items(&response, "blocks") {
                println!(
                    "  {:<10} {:<8} {:<12} {}",
                    str_field(block, "id"),
                    str_field(block, "node"),
                    str_field(block, "status"),
                    str_field(block, "primary_for"),
                );
            }
        }

        Commands::Files => {
            let response = client.files().await?;
            for file in items(&response, "files") {
                println!(
                    "{}  {}  {} blocks",
                    str_field(file, "file_id"),
                    str_field(file, "original_filename"),
                    file["total_blocks"],
                );
            }
        }

        Commands::Register { capacity, node_id } => {
            let response = client.register(node_id.as_deref(), capacity).await?;
            println!(
                "✓ Registered {} ({})",
                str_field(&response, "node_id"),
                format_bytes(u64::from(capacity) * miniblock::common::BLOCK_SIZE)
            );
        }

        Commands::Upload { file, uploader } => {
            let response = client.upload_file(&file, uploader.as_deref()).await?;
            println!("✓ Placed {} as {}", file.display(), str_field(&response, "file_id"));
            if response["degraded"].as_bool() == Some(true) {
                println!("  warning: some blocks have fewer replicas than requested");
            }
            for placement in items(&response, "placements") {
                println!(
                    "  block {:>4}: {} on {}, replicas {}",
                    placement["file_block_index"],
                    str_field(placement, "primary_block_id"),
                    str_field(placement, "primary_node"),
                    placement["replica_nodes"],
                );
            }
        }

        Commands::Delete { file_id } => {
            let response = client.delete(&file_id).await?;
            println!(
                "✓ Deleted {} ({} blocks released)",
                file_id, response["released_blocks"]
            );
        }
    }

    Ok(())
}
