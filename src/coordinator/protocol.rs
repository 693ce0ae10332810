//! Node ↔ coordinator wire protocol
//!
//! One compact JSON object per line, tagged by a mandatory `type` field.
//! Frames are decoded once at the boundary into [`Inbound`]; unknown types
//! and malformed frames are reported to the caller, which logs and ignores
//! them.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// `SEND_MESSAGE` target addressing the coordinator itself
pub const COORDINATOR_ID: &str = "COORDINATOR";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Default upper bound on one frame, newline excluded
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Messages sent by storage nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMessage {
    RegisterNode {
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        listen_port: Option<u16>,
        /// Declared capacity in blocks; absent keeps the recorded value
        #[serde(default)]
        capacity: Option<u32>,
    },
    GetNodos,
    SendMessage {
        from: String,
        to: String,
        content: String,
    },
    Ping,
    Pong {
        #[serde(default)]
        node_id: Option<String>,
    },
    Disconnect {
        #[serde(default)]
        node_id: Option<String>,
    },
}

impl NodeMessage {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "REGISTER_NODE",
        "GET_NODOS",
        "SEND_MESSAGE",
        "PING",
        "PONG",
        "DISCONNECT",
    ];
}

/// Messages sent by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorMessage {
    RegisterOk { node_id: String },
    NodosList { nodos: Vec<String> },
    MessageReceived { message: String },
    MessageSent { to: String },
    ReceiveMessage { from: String, content: String },
    Ping,
    Pong,
    NodeConnected { node_id: String, ip: String, port: u16 },
    NodeDisconnected { node_id: String },
    DisconnectOk { node_id: String },
    Error { message: String },
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(NodeMessage),
    /// Well-formed JSON with a `type` this coordinator does not handle
    Unrecognized(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    #[error("frame exceeds {max} bytes")]
    FrameTooLong { max: usize },
}

/// One unit read off the wire
#[derive(Debug)]
pub enum Frame {
    Text(String),
    /// Bytes that cannot be a message; the rest of the stream is still usable
    Malformed(ProtocolError),
}

/// Decode one frame.
pub fn decode(frame: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(frame).map_err(ProtocolError::InvalidJson)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !NodeMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unrecognized(kind));
    }

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Newline-delimited frame reader with a size cap.
///
/// Partial input is kept in the reader between calls, so `next_frame` can
/// be raced in `select!` without losing bytes.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Next non-empty frame, or `None` on orderly close.
    ///
    /// An oversized frame is reported once as [`ProtocolError::FrameTooLong`]
    /// and its remaining bytes are skipped up to the next newline.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                let pending = std::mem::take(&mut self.buf);
                let discarded = std::mem::replace(&mut self.discarding, false);
                if discarded || pending.is_empty() {
                    return Ok(None);
                }
                // Unterminated trailing frame
                return Ok(finish_frame(pending));
            }

            let (take, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            if !self.discarding {
                self.buf.extend_from_slice(&available[..take]);
            }
            self.reader.consume(take);

            if self.discarding {
                if complete {
                    self.discarding = false;
                }
                continue;
            }

            let content_len = self.buf.len() - usize::from(complete);
            if content_len > self.max_len {
                self.buf.clear();
                self.discarding = !complete;
                return Ok(Some(Frame::Malformed(ProtocolError::FrameTooLong {
                    max: self.max_len,
                })));
            }

            if complete {
                if let Some(frame) = finish_frame(std::mem::take(&mut self.buf)) {
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// `None` for blank lines
fn finish_frame(bytes: Vec<u8>) -> Option<Frame> {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return Some(Frame::Malformed(ProtocolError::InvalidUtf8(e.utf8_error()))),
    };
    let trimmed = text.trim_end_matches(LINE_ENDINGS);
    if trimmed.trim().is_empty() {
        None
    } else {
        Some(Frame::Text(trimmed.to_string()))
    }
}

/// Read and parse one message (node-side helper).
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Compact JSON never contains a raw newline, so the delimiter is unambiguous.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_decode_register() {
        let inbound = decode(r#"{"type":"REGISTER_NODE","node_id":"node3","listen_port":6000}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message(NodeMessage::RegisterNode {
                node_id: Some("node3".into()),
                listen_port: Some(6000),
                capacity: None,
            })
        );
    }

    #[test]
    fn test_decode_unit_variants() {
        assert_eq!(
            decode(r#"{"type":"GET_NODOS"}"#).unwrap(),
            Inbound::Message(NodeMessage::GetNodos)
        );
        assert_eq!(
            decode(r#"{"type":"PONG"}"#).unwrap(),
            Inbound::Message(NodeMessage::Pong { node_id: None })
        );
    }

    #[test]
    fn test_decode_unrecognized() {
        assert_eq!(
            decode(r#"{"type":"FORMAT_DISK","node_id":"node1"}"#).unwrap(),
            Inbound::Unrecognized("FORMAT_DISK".into())
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode(r#"{"node_id":"x"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(decode(r#"{"type":7}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"SEND_MESSAGE","from":"node1"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_coordinator_message_tags() {
        let encoded = serde_json::to_value(CoordinatorMessage::RegisterOk {
            node_id: "node1".into(),
        })
        .unwrap();
        assert_eq!(encoded["type"], "REGISTER_OK");

        let encoded = serde_json::to_value(CoordinatorMessage::NodeDisconnected {
            node_id: "node2".into(),
        })
        .unwrap();
        assert_eq!(encoded["type"], "NODE_DISCONNECTED");
    }

    fn text(frame: Option<Frame>) -> String {
        match frame {
            Some(Frame::Text(text)) => text,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_skip_blank_lines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"\n\r\n{\"type\":\"PING\"}\r\n").await.unwrap();
        drop(writer);

        let mut frames = FrameReader::new(BufReader::new(reader), DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(text(frames.next_frame().await.unwrap()), r#"{"type":"PING"}"#);
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed_not_fatal() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"\xff\xfe garbage\n{\"type\":\"PING\"}\n").await.unwrap();
        drop(writer);

        let mut frames = FrameReader::new(BufReader::new(reader), DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Malformed(ProtocolError::InvalidUtf8(_)))
        ));
        assert_eq!(text(frames.next_frame().await.unwrap()), r#"{"type":"PING"}"#);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let mut input = vec![b'x'; 5000];
        input.extend_from_slice(b"\n{\"type\":\"PING\"}\n");
        writer.write_all(&input).await.unwrap();
        drop(writer);

        // Small internal buffer so the long frame arrives in pieces
        let mut frames = FrameReader::new(BufReader::with_capacity(64, reader), 1024);
        assert!(matches!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Malformed(ProtocolError::FrameTooLong { max: 1024 }))
        ));
        assert_eq!(text(frames.next_frame().await.unwrap()), r#"{"type":"PING"}"#);
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"{\"type\":\"PING\"}\n").await.unwrap();
        drop(writer);

        let mut frames = FrameReader::new(BufReader::new(reader), r#"{"type":"PING"}"#.len());
        assert_eq!(text(frames.next_frame().await.unwrap()), r#"{"type":"PING"}"#);
    }

    #[tokio::test]
    async fn test_write_then_read_message() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);
        let message = CoordinatorMessage::NodeConnected {
            node_id: "node4".into(),
            ip: "10.0.0.4".into(),
            port: 6004,
        };

        write_message(&mut writer, &message).await.unwrap();
        let parsed: CoordinatorMessage = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(parsed, message);
    }
}
