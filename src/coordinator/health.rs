//! Heartbeat monitor
//!
//! Every interval: queue a `PING` on each session, then expire nodes whose
//! ping could not be queued, whose last `PONG` is too old, or which have
//! no socket and have not called `/heartbeat` in time. Each expired node
//! is announced once per cycle.

use crate::coordinator::state::Coordinator;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Nodes to expire this cycle, deduplicated
pub fn collect_expired(
    ping_failures: impl IntoIterator<Item = String>,
    stale: impl IntoIterator<Item = String>,
) -> BTreeSet<String> {
    ping_failures.into_iter().chain(stale).collect()
}

/// One monitor cycle. Returns the nodes that went offline.
pub fn check_once(coordinator: &Coordinator, timeout: Duration) -> Vec<String> {
    let ping_failures = coordinator.ping_all();
    let stale = coordinator.stale_nodes(Instant::now(), chrono::Utc::now(), timeout);
    let expired = collect_expired(ping_failures, stale);
    if expired.is_empty() {
        return Vec::new();
    }
    coordinator.expire(&expired)
}

pub async fn run_health_monitor(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; nodes get a full interval first.
    tick.tick().await;

    tracing::info!(
        interval_ms = interval.as_millis() as u64,
        timeout_ms = timeout.as_millis() as u64,
        "health monitor started"
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let expired = check_once(&coordinator, timeout);
        for node_id in &expired {
            tracing::warn!(node_id = %node_id, "node missed heartbeat, marked offline");
        }
    }

    tracing::info!("health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::protocol::CoordinatorMessage;
    use tokio::sync::mpsc;

    #[test]
    fn test_collect_expired_dedups() {
        let expired = collect_expired(
            vec!["node2".to_string(), "node1".to_string()],
            vec!["node1".to_string(), "node3".to_string()],
        );
        assert_eq!(
            expired.into_iter().collect::<Vec<_>>(),
            vec!["node1", "node2", "node3"]
        );
    }

    #[test]
    fn test_closed_queue_expires_once() {
        let coordinator = Coordinator::in_memory(2);
        let (tx_dead, rx_dead) = mpsc::channel(4);
        let (tx_live, mut rx_live) = mpsc::channel(16);
        coordinator.attach_session(Some("node1"), "10.0.0.1", None, Some(1), tx_dead);
        coordinator.attach_session(Some("node2"), "10.0.0.2", None, Some(1), tx_live);
        drop(rx_dead);

        let expired = check_once(&coordinator, Duration::from_secs(60));
        assert_eq!(expired, vec!["node1"]);
        assert!(check_once(&coordinator, Duration::from_secs(60)).is_empty());

        let mut disconnects = 0;
        while let Ok(message) = rx_live.try_recv() {
            if message
                == (CoordinatorMessage::NodeDisconnected {
                    node_id: "node1".into(),
                })
            {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_live_session_survives() {
        let coordinator = Coordinator::in_memory(2);
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.attach_session(Some("node1"), "10.0.0.1", None, Some(1), tx);

        assert!(check_once(&coordinator, Duration::from_secs(60)).is_empty());
        assert_eq!(rx.try_recv().unwrap(), CoordinatorMessage::Ping);
    }

    #[test]
    fn test_missing_pong_expires() {
        let coordinator = Coordinator::in_memory(2);
        let (tx, _rx) = mpsc::channel(16);
        coordinator.attach_session(Some("node1"), "10.0.0.1", None, Some(1), tx);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(check_once(&coordinator, Duration::from_millis(5)), vec!["node1"]);
        assert!(!coordinator.node("node1").unwrap().status.is_online());
    }

    #[test]
    fn test_socketless_node_expires_without_heartbeat() {
        let coordinator = Coordinator::in_memory(2);
        coordinator.register("10.0.0.1", 2);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(check_once(&coordinator, Duration::from_millis(5)), vec!["node1"]);
    }
}
