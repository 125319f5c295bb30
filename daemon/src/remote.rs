use std::time::Duration;

use common::Connection;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::scanner::FileCandidate;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reported to the server so it can group assets by source device.
const DEVICE_ID: &str = "shuttersync";

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("server URL is empty")]
    EmptyServerUrl,
    #[error("unauthorized: the server rejected the API key")]
    Unauthorized,
    #[error("payload too large: the server refused the file size")]
    PayloadTooLarge,
    #[error("server error: HTTP {0}")]
    Server(StatusCode),
    #[error("request rejected: HTTP {0}")]
    Rejected(StatusCode),
    #[error("cannot read {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl RemoteError {
    /// Server-side (5xx) and transport failures are worth retrying.
    /// Everything else will fail the same way on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Server(_) | RemoteError::Network(_))
    }

    fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            RemoteError::Unauthorized
        } else if status == StatusCode::PAYLOAD_TOO_LARGE {
            RemoteError::PayloadTooLarge
        } else if status.is_server_error() {
            RemoteError::Server(status)
        } else {
            RemoteError::Rejected(status)
        }
    }
}

/// What the server answered for a completed upload. The server resolves
/// concurrent uploads of identical content by accepting one and reporting
/// the rest as duplicates, so `duplicate` can be true even after the
/// pre-upload check said the content was new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub asset_id: String,
    pub duplicate: bool,
}

#[derive(Serialize)]
struct BulkCheckRequest {
    assets: Vec<AssetCheckItem>,
}

#[derive(Serialize)]
struct AssetCheckItem {
    id: String,
    checksum: String,
}

#[derive(Deserialize)]
struct BulkCheckResponse {
    results: Vec<AssetCheckResult>,
}

#[derive(Deserialize)]
struct AssetCheckResult {
    action: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
    #[serde(default)]
    status: String,
}

/// Thin adapter over the asset server's HTTP API: connection test,
/// duplicate check, asset upload. One instance shares its connection pool
/// across all concurrent passes.
pub struct AssetClient {
    http: Client,
}

impl AssetClient {
    pub fn new() -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::builder().build()?,
        })
    }

    /// Authenticated lightweight request against the server. An
    /// unreachable or rejecting server is an answer (`false`), not an
    /// error; only a blank URL is hard-rejected.
    pub async fn test_connection(&self, conn: &Connection) -> Result<bool, RemoteError> {
        if conn.server_url.trim().is_empty() {
            return Err(RemoteError::EmptyServerUrl);
        }
        let url = format!(
            "{}/api/server/statistics",
            conn.server_url.trim_end_matches('/')
        );
        match self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &conn.api_key)
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// True if the server already holds an asset with this content digest.
    pub async fn check_duplicate(
        &self,
        conn: &Connection,
        checksum: &str,
    ) -> Result<bool, RemoteError> {
        let url = format!(
            "{}/api/assets/bulk-upload-check",
            conn.server_url.trim_end_matches('/')
        );
        let body = BulkCheckRequest {
            assets: vec![AssetCheckItem {
                id: "candidate".to_string(),
                checksum: checksum.to_string(),
            }],
        };

        let resp = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &conn.api_key)
            .timeout(CHECK_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status));
        }

        let parsed: BulkCheckResponse = resp.json().await?;
        // The server answers "accept" for content it wants, anything else
        // means it already holds it.
        Ok(parsed
            .results
            .first()
            .map(|r| r.action != "accept")
            .unwrap_or(false))
    }

    /// Multipart upload, streaming the file body. Metadata carries the
    /// original filename and the capture/modification timestamps so the
    /// server files the asset on the right date.
    pub async fn upload(
        &self,
        conn: &Connection,
        candidate: &FileCandidate,
    ) -> Result<UploadReceipt, RemoteError> {
        let url = format!("{}/api/assets", conn.server_url.trim_end_matches('/'));

        let file = tokio::fs::File::open(&candidate.path)
            .await
            .map_err(|source| RemoteError::FileRead {
                path: candidate.path.display().to_string(),
                source,
            })?;
        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), candidate.size)
            .file_name(candidate.file_name.clone());

        let form = Form::new()
            .text("deviceAssetId", device_asset_id(candidate))
            .text("deviceId", DEVICE_ID)
            .text("fileCreatedAt", candidate.created.to_rfc3339())
            .text("fileModifiedAt", candidate.modified.to_rfc3339())
            .text("isFavorite", "false")
            .part("assetData", part);

        let resp = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &conn.api_key)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status));
        }

        let parsed: UploadResponse = resp.json().await?;
        Ok(UploadReceipt {
            asset_id: parsed.id,
            duplicate: parsed.status == "duplicate",
        })
    }
}

fn device_asset_id(candidate: &FileCandidate) -> String {
    format!("{}-{}", candidate.file_name, candidate.size).replace(char::is_whitespace, "")
}
