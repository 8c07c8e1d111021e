//! One-shot network endpoints: download-to-path and the current port set.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use super::envelope::Envelope;
use super::error::ApiError;
use super::fs::absolute;
use super::AppState;
use crate::portmon::{Protocol, SocketTableReader};

#[derive(Debug, Deserialize)]
pub(super) struct DownloadRequest {
    url: String,
    path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub bytes_written: u64,
    pub content_type: String,
    pub file_path: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_interface() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize)]
pub(super) struct PortsQuery {
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default = "default_interface")]
    interface: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortsResult {
    pub ports: Vec<u16>,
    pub protocol: Protocol,
    pub interface: String,
    pub count: usize,
}

/// Fetch `url` and stream the body into `path`, creating parent
/// directories. Anything but a 200 from the source is a failure.
pub(super) async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<Envelope<DownloadResult>>, ApiError> {
    let Json(req) = payload?;
    if req.url.is_empty() {
        return Err(ApiError::InvalidRequest("url is required".to_string()));
    }
    let path = absolute(&req.path)?;

    let response = state
        .http
        .get(&req.url)
        .send()
        .await
        .map_err(|e| ApiError::DownloadFailed(e.to_string()))?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(ApiError::UpstreamStatus(response.status().as_u16()));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::io(parent, e))?;
    }
    let bytes_written = match stream_to_file(response, &path).await {
        Ok(n) => n,
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %rm, "no partial download to remove");
            }
            return Err(e);
        }
    };

    tracing::info!(url = %req.url, path = %path.display(), bytes = bytes_written, "download complete");
    Ok(Envelope::ok(
        "File downloaded successfully",
        DownloadResult {
            bytes_written,
            content_type,
            file_path: path.display().to_string(),
        },
    ))
}

async fn stream_to_file(mut response: reqwest::Response, path: &Path) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ApiError::io(path, e))?;
    let mut bytes_written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ApiError::DownloadFailed(e.to_string()))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| ApiError::io(path, e))?;
    Ok(bytes_written)
}

pub(super) async fn ports(
    State(state): State<AppState>,
    query: Result<Query<PortsQuery>, QueryRejection>,
) -> Result<Json<Envelope<PortsResult>>, ApiError> {
    let Query(query) = query?;
    let protocol: Protocol = query
        .protocol
        .parse()
        .map_err(|e: crate::portmon::PortMonError| ApiError::InvalidRequest(e.to_string()))?;
    if query.interface.is_empty() {
        return Err(ApiError::InvalidRequest("interface must not be empty".to_string()));
    }

    let ports = SocketTableReader::new(state.settings.proc_root.clone())
        .sample_blocking(protocol, &query.interface)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    let ports: Vec<u16> = ports.into_iter().collect();

    Ok(Envelope::ok(
        "Current listening ports retrieved",
        PortsResult {
            count: ports.len(),
            ports,
            protocol,
            interface: query.interface,
        },
    ))
}
