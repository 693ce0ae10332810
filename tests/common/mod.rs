//! Shared harness: a coordinator on ephemeral ports and a scripted node

#![allow(dead_code)]

use miniblock::common::CoordinatorConfig;
use miniblock::coordinator::protocol::{read_message, write_message};
use miniblock::{Coordinator, CoordinatorServer};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(3);

pub fn test_config(data_dir: &Path) -> CoordinatorConfig {
    CoordinatorConfig {
        node_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        discovery_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_ip: Some("127.0.0.1".parse().unwrap()),
        data_dir: data_dir.to_path_buf(),
        // Long enough that no PING shows up unless a test asks for it
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_floor_ms: 60_000,
        ..Default::default()
    }
}

pub struct RunningServer {
    pub coordinator: Arc<Coordinator>,
    pub node_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub discovery_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningServer {
    pub async fn start(config: CoordinatorConfig) -> Self {
        let server = CoordinatorServer::bind(config).await.unwrap();
        let coordinator = server.coordinator();
        let node_addr = server.node_addr().unwrap();
        let http_addr = server.http_addr().unwrap();
        let discovery_addr = server.discovery_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            server.run(shutdown_rx).await.unwrap();
        });
        Self {
            coordinator,
            node_addr,
            http_addr,
            discovery_addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, self.handle).await.unwrap().unwrap();
    }
}

/// A node speaking the line protocol by hand
pub struct TestNode {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestNode {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, message: Value) {
        write_message(&mut self.writer, &message).await.unwrap();
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.send_raw_bytes(line.as_bytes()).await;
        self.send_raw_bytes(b"\n").await;
    }

    /// Write bytes as-is, no newline appended
    pub async fn send_raw_bytes(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Next frame, or `None` once the coordinator closed the socket
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, read_message::<_, Value>(&mut self.reader)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) | Err(_) => None,
        }
    }

    pub async fn recv(&mut self) -> Value {
        self.try_recv(WAIT).await.expect("expected a frame")
    }

    /// Skip frames until one of type `kind` arrives
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    pub async fn register(&mut self, node_id: &str, listen_port: u16, capacity: u32) -> String {
        self.send(json!({
            "type": "REGISTER_NODE",
            "node_id": node_id,
            "listen_port": listen_port,
            "capacity": capacity,
        }))
        .await;
        let reply = self.recv_type("REGISTER_OK").await;
        reply["node_id"].as_str().unwrap().to_string()
    }

    /// Reads until the socket closes; true if it did within `wait`
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return false;
            }
            match tokio::time::timeout(left, read_message::<_, Value>(&mut self.reader)).await {
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Ok(Ok(Some(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}
