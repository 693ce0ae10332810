//! Per-connection task
//!
//! Each accepted socket gets one task that owns both halves. Inbound frames
//! are decoded and applied through the [`Coordinator`]; outbound frames
//! arrive on the session's bounded queue once the node has registered.
//! When the coordinator drops the queue the task closes the socket.

use crate::common::{CoordinatorConfig, Error};
use crate::coordinator::protocol::{
    decode, write_message, CoordinatorMessage, Frame, FrameReader, Inbound, NodeMessage,
    ProtocolError, COORDINATOR_ID,
};
use crate::coordinator::state::{Attached, Coordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Knobs a session needs from the configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub send_timeout: Duration,
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
}

impl From<&CoordinatorConfig> for SessionSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            outbound_queue: config.outbound_queue,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// Per-connection state
struct Session<W> {
    coordinator: Arc<Coordinator>,
    peer: SocketAddr,
    writer: W,
    settings: SessionSettings,
    bound: Option<Attached>,
    outbound: Option<mpsc::Receiver<CoordinatorMessage>>,
}

/// Serve one node connection until it disconnects or is dropped.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
    settings: SessionSettings,
) {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(read_half), settings.max_frame_bytes);
    let mut session = Session {
        coordinator,
        peer,
        writer: write_half,
        settings,
        bound: None,
        outbound: None,
    };

    tracing::debug!(%peer, "connection accepted");

    loop {
        tokio::select! {
            frame = frames.next_frame() => match frame {
                Ok(Some(Frame::Text(frame))) => {
                    if let Flow::Close = session.on_frame(&frame).await {
                        break;
                    }
                }
                Ok(Some(Frame::Malformed(e))) => session.ignore_malformed(&e),
                Ok(None) => {
                    tracing::debug!(%peer, "connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "read failed");
                    break;
                }
            },
            queued = next_outbound(&mut session.outbound) => match queued {
                Some(message) => {
                    if let Err(e) = session.send(&message).await {
                        tracing::warn!(%peer, error = %e, "send failed, closing session");
                        break;
                    }
                }
                None => {
                    tracing::debug!(%peer, "session dropped by coordinator");
                    break;
                }
            },
        }
    }

    // EOF and read errors count as an implicit DISCONNECT without reply.
    if let Some(attached) = session.bound.take() {
        session
            .coordinator
            .detach_session(&attached.node_id, attached.session_id);
    }
}

async fn next_outbound(rx: &mut Option<mpsc::Receiver<CoordinatorMessage>>) -> Option<CoordinatorMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<W: AsyncWrite + Unpin> Session<W> {
    async fn send(&mut self, message: &CoordinatorMessage) -> Result<(), Error> {
        match timeout(self.settings.send_timeout, write_message(&mut self.writer, message)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "send timed out",
            ))),
        }
    }

    /// Reply to the caller; a failed reply ends the session.
    async fn reply(&mut self, message: CoordinatorMessage) -> Flow {
        match self.send(&message).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "reply failed, closing session");
                Flow::Close
            }
        }
    }

    fn node_id(&self) -> Option<&str> {
        self.bound.as_ref().map(|a| a.node_id.as_str())
    }

    async fn on_frame(&mut self, frame: &str) -> Flow {
        match decode(frame) {
            Ok(Inbound::Message(message)) => self.on_message(message).await,
            Ok(Inbound::Unrecognized(kind)) => {
                tracing::warn!(peer = %self.peer, kind = %kind, "ignoring unrecognized message type");
                Flow::Continue
            }
            Err(e) => {
                self.ignore_malformed(&e);
                Flow::Continue
            }
        }
    }

    fn ignore_malformed(&self, error: &ProtocolError) {
        tracing::warn!(peer = %self.peer, error = %error, "ignoring malformed frame");
    }

    async fn on_message(&mut self, message: NodeMessage) -> Flow {
        match message {
            NodeMessage::RegisterNode {
                node_id,
                listen_port,
                capacity,
            } => self.on_register(node_id, listen_port, capacity).await,

            NodeMessage::GetNodos => {
                let nodos = self.coordinator.peer_ids(self.node_id());
                self.reply(CoordinatorMessage::NodosList { nodos }).await
            }

            NodeMessage::SendMessage { from, to, content } => {
                if to == COORDINATOR_ID {
                    tracing::info!(from = %from, content = %content, "message for coordinator");
                    return self
                        .reply(CoordinatorMessage::MessageReceived {
                            message: format!("coordinator received: {content}"),
                        })
                        .await;
                }
                match self.coordinator.forward(&from, &to, &content) {
                    Ok(()) => self.reply(CoordinatorMessage::MessageSent { to }).await,
                    Err(e) => {
                        tracing::debug!(from = %from, to = %to, error = %e, "forward failed");
                        self.reply(CoordinatorMessage::Error {
                            message: format!("node {to} is not reachable"),
                        })
                        .await
                    }
                }
            }

            NodeMessage::Ping => self.reply(CoordinatorMessage::Pong).await,

            NodeMessage::Pong { node_id } => {
                match self.node_id().map(str::to_string).or(node_id) {
                    Some(id) => self.coordinator.record_pong(&id),
                    None => tracing::debug!(peer = %self.peer, "PONG from unregistered connection"),
                }
                Flow::Continue
            }

            NodeMessage::Disconnect { node_id } => {
                let node_id = match (self.bound.take(), node_id) {
                    (Some(attached), _) => {
                        self.coordinator
                            .detach_session(&attached.node_id, attached.session_id);
                        attached.node_id
                    }
                    (None, Some(id)) => id,
                    (None, None) => String::new(),
                };
                self.outbound = None;
                tracing::info!(peer = %self.peer, node_id = %node_id, "graceful disconnect");
                // Best effort: the socket closes either way.
                let _ = self.reply(CoordinatorMessage::DisconnectOk { node_id }).await;
                Flow::Close
            }
        }
    }

    async fn on_register(
        &mut self,
        node_id: Option<String>,
        listen_port: Option<u16>,
        capacity: Option<u32>,
    ) -> Flow {
        // Re-registering under another id releases the old binding first.
        if let Some(previous) = &self.bound {
            if node_id.as_deref().is_some_and(|id| id != previous.node_id) {
                self.coordinator
                    .detach_session(&previous.node_id, previous.session_id);
                self.bound = None;
            }
        }
        let node_id = node_id.or_else(|| self.node_id().map(str::to_string));

        let (tx, rx) = mpsc::channel(self.settings.outbound_queue);
        let ip = self.peer.ip().to_string();
        let attached =
            self.coordinator
                .attach_session(node_id.as_deref(), &ip, listen_port, capacity, tx);

        tracing::info!(
            peer = %self.peer,
            node_id = %attached.node_id,
            session_id = attached.session_id,
            "node registered"
        );

        let node_id = attached.node_id.clone();
        self.bound = Some(attached);
        self.outbound = Some(rx);
        self.reply(CoordinatorMessage::RegisterOk { node_id }).await
    }
}
