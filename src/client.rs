//! HTTP client for the coordinator API, used by the `miniblock` CLI

use crate::common::{blocks_for_size, Error, Result, BLOCK_SIZE};
use crate::coordinator::files::ChunkInfo;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("{url}: {e}")))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("{url}: invalid response: {e}")))?;

        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(match status {
                StatusCode::NOT_FOUND => Error::FileNotFound(message),
                StatusCode::BAD_REQUEST => Error::InvalidRequest(message),
                StatusCode::CONFLICT => Error::Conflict(message),
                _ => Error::Internal(format!("{status}: {message}")),
            });
        }
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn nodes(&self, include_offline: bool) -> Result<Value> {
        self.call(
            Method::GET,
            &format!("/nodes?include_offline={include_offline}"),
            None,
        )
        .await
    }

    pub async fn blocks(&self) -> Result<Value> {
        self.call(Method::GET, "/blocks", None).await
    }

    pub async fn files(&self) -> Result<Value> {
        self.call(Method::GET, "/files", None).await
    }

    pub async fn health(&self) -> Result<Value> {
        self.call(Method::GET, "/health", None).await
    }

    pub async fn register(&self, node_id: Option<&str>, capacity: u32) -> Result<Value> {
        self.call(
            Method::POST,
            "/register",
            Some(json!({ "node_id": node_id, "capacity": capacity })),
        )
        .await
    }

    /// Describe a local file in 1 MiB blocks and ask for placements.
    pub async fn upload_file(&self, path: &Path, uploader: Option<&str>) -> Result<Value> {
        let size = tokio::fs::metadata(path).await?.len();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidRequest(format!("{} is not a file", path.display())))?;

        let total_blocks = blocks_for_size(size);
        let chunks: Vec<ChunkInfo> = (1..=total_blocks)
            .map(|index| ChunkInfo {
                index: index as u32,
                size: BLOCK_SIZE.min(size - (index - 1) * BLOCK_SIZE),
                path: None,
            })
            .collect();

        self.call(
            Method::POST,
            "/upload",
            Some(json!({
                "filename": filename,
                "uploader": uploader,
                "total_blocks": total_blocks,
                "chunks": chunks,
            })),
        )
        .await
    }

    pub async fn delete(&self, file_id: &str) -> Result<Value> {
        self.call(Method::DELETE, &format!("/files/{file_id}"), None).await
    }
}
