//! End-to-end tests of the node line protocol over TCP

mod common;

use common::{test_config, RunningServer, TestNode};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_register_broadcasts_to_other_nodes() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(test_config(dir.path())).await;

    let mut a = TestNode::connect(server.node_addr).await;
    assert_eq!(a.register("node1", 7001, 4).await, "node1");

    let mut b = TestNode::connect(server.node_addr).await;
    assert_eq!(b.register("node2", 7002, 4).await, "node2");

    let event = a.recv().await;
    assert_eq!(
        event,
        json!({"type": "NODE_CONNECTED", "node_id": "node2", "ip": "127.0.0.1", "port": 7002})
    );

    // The registering node does not hear about itself
    b.send(json!({"type": "GET_NODOS"})).await;
    assert_eq!(b.recv().await, json!({"type": "NODOS_LIST", "nodos": ["node1"]}));

    let node = server.coordinator.node("node2").unwrap();
    assert!(node.status.is_online());
    assert_eq!(node.capacity, 4);
    assert_eq!(server.coordinator.block_table().blocks_of("node2").count(), 4);

    server.stop().await;
}

#[tokio::test]
async fn test_message_forwarding() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(test_config(dir.path())).await;

    let mut a = TestNode::connect(server.node_addr).await;
    a.register("node1", 7001, 1).await;
    let mut b = TestNode::connect(server.node_addr).await;
    b.register("node2", 7002, 1).await;
    a.recv_type("NODE_CONNECTED").await;

    a.send(json!({"type": "SEND_MESSAGE", "from": "node1", "to": "node2", "content": "hola"}))
        .await;
    assert_eq!(a.recv().await, json!({"type": "MESSAGE_SENT", "to": "node2"}));
    assert_eq!(
        b.recv().await,
        json!({"type": "RECEIVE_MESSAGE", "from": "node1", "content": "hola"})
    );

    a.send(json!({"type": "SEND_MESSAGE", "from": "node1", "to": "COORDINATOR", "content": "hi"}))
        .await;
    assert_eq!(a.recv().await["type"], "MESSAGE_RECEIVED");

    a.send(json!({"type": "SEND_MESSAGE", "from": "node1", "to": "node9", "content": "?"}))
        .await;
    let error = a.recv().await;
    assert_eq!(error["type"], "ERROR");
    assert!(error["message"].as_str().unwrap().contains("node9"));

    server.stop().await;
}

#[tokio::test]
async fn test_bad_frames_are_ignored() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(test_config(dir.path())).await;

    let mut node = TestNode::connect(server.node_addr).await;
    node.register("node1", 7001, 1).await;

    node.send_raw("this is not json").await;
    node.send_raw(r#"{"no_type": true}"#).await;
    node.send_raw(r#"{"type": "FORMAT_DISK"}"#).await;
    node.send_raw(r#"{"type": "SEND_MESSAGE", "from": "node1"}"#).await;
    node.send_raw_bytes(b"\xff\xfe garbage\n").await;
    node.send(json!({"type": "PING"})).await;

    assert_eq!(node.recv().await, json!({"type": "PONG"}));
    assert!(server.coordinator.is_connected("node1"));
    assert!(server.coordinator.node("node1").unwrap().status.is_online());

    server.stop().await;
}

#[tokio::test]
async fn test_graceful_disconnect() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(test_config(dir.path())).await;

    let mut a = TestNode::connect(server.node_addr).await;
    a.register("node1", 7001, 2).await;
    let mut b = TestNode::connect(server.node_addr).await;
    b.register("node2", 7002, 2).await;

    a.send(json!({"type": "DISCONNECT", "node_id": "node1"})).await;
    a.recv_type("DISCONNECT_OK").await;
    assert!(a.closed_within(Duration::from_secs(2)).await);

    assert_eq!(
        b.recv().await,
        json!({"type": "NODE_DISCONNECTED", "node_id": "node1"})
    );

    let node = server.coordinator.node("node1").unwrap();
    assert!(!node.status.is_online());
    assert!(!server.coordinator.is_connected("node1"));
    // Records are kept after disconnect
    b.send(json!({"type": "GET_NODOS"})).await;
    assert_eq!(b.recv().await, json!({"type": "NODOS_LIST", "nodos": ["node1"]}));

    server.stop().await;
}

#[tokio::test]
async fn test_eof_is_implicit_disconnect() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(test_config(dir.path())).await;

    let mut observer = TestNode::connect(server.node_addr).await;
    observer.register("node1", 7001, 1).await;
    let mut leaver = TestNode::connect(server.node_addr).await;
    leaver.register("node2", 7002, 1).await;
    observer.recv_type("NODE_CONNECTED").await;

    drop(leaver);

    assert_eq!(
        observer.recv().await,
        json!({"type": "NODE_DISCONNECTED", "node_id": "node2"})
    );
    assert!(!server.coordinator.node("node2").unwrap().status.is_online());

    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_replaces_old_session() {
    let dir = TempDir::new().unwrap();
    let server = RunningServer::start(test_config(dir.path())).await;

    let mut first = TestNode::connect(server.node_addr).await;
    first.register("node1", 7001, 2).await;

    let mut second = TestNode::connect(server.node_addr).await;
    second.register("node1", 7001, 2).await;

    // The stale connection is closed by the coordinator
    assert!(first.closed_within(Duration::from_secs(2)).await);

    second.send(json!({"type": "PING"})).await;
    second.recv_type("PONG").await;
    assert!(server.coordinator.is_connected("node1"));
    assert!(server.coordinator.node("node1").unwrap().status.is_online());

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_is_discarded() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.max_frame_bytes = 256;
    let server = RunningServer::start(config).await;

    let mut node = TestNode::connect(server.node_addr).await;
    node.register("node1", 7001, 1).await;

    // Several times the cap, split across writes before the newline
    for _ in 0..8 {
        node.send_raw_bytes(&[b'x'; 200]).await;
    }
    node.send_raw_bytes(b"\n").await;
    node.send(json!({"type": "PING"})).await;

    assert_eq!(node.recv().await, json!({"type": "PONG"}));
    assert!(server.coordinator.is_connected("node1"));

    server.stop().await;
}
