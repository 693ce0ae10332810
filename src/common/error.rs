//! Error types for miniblock

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::coordinator::placement::PlacementError;
use crate::coordinator::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // === Registry Errors ===
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {0} is not connected")]
    NotConnected(String),

    // === Block / File Errors ===
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    Placement(#[from] PlacementError),

    #[error("Placement conflict: {0}")]
    Conflict(String),

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // === Request Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::NotConnected(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::NodeNotFound(_) | Error::FileNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) | Error::InvalidConfig(_) | Error::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Placement(_) | Error::NotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::warn!(status = %status.as_u16(), error = %self, "request failed");
        }
        (status, axum::Json(json!({ "status": "ERROR", "error": self.to_string() }))).into_response()
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::NodeNotFound("node1".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Placement(PlacementError::NoOnlineNodes).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::InvalidRequest("empty file".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_placement_reason_is_verbatim() {
        let err = Error::from(PlacementError::NoFreeBlocks);
        assert_eq!(err.to_string(), PlacementError::NoFreeBlocks.to_string());
    }
}
