//! HTTP adapter for the remote geodatabase service.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use fieldsync_common::{EditId, EditKind, Entity, EntityId, Error, LocalEdit, Result};

use crate::gateway::{DatasetSnapshot, EditOutcome, RemoteGateway, TransferProgress, UploadOutcome};

/// Upload endpoint, relative to the base URL.
const EDITS_PATH: &str = "edits";
/// Snapshot endpoint, relative to the base URL.
const SNAPSHOT_PATH: &str = "snapshot";

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL of the sync API (e.g., `https://gis.example.org/api/sync/`).
    pub base_url: String,
    /// Whole-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("fieldsync/{}", env!("CARGO_PKG_VERSION"))
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEdit<'a> {
    edit_id: &'a EditId,
    kind: EditKind,
    target_id: &'a EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Entity>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    edits: Vec<WireEdit<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireStatus {
    Accepted,
    Rejected,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResult {
    edit_id: EditId,
    status: WireStatus,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    retriable: Option<bool>,
    #[serde(default)]
    server_id: Option<EntityId>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    results: Vec<WireResult>,
}

/// Gateway speaking JSON over HTTP.
pub struct HttpGateway {
    http: Client,
    base: Url,
}

impl HttpGateway {
    /// Create a new HTTP gateway.
    ///
    /// # Errors
    /// - Base URL is not a valid absolute URL
    /// - HTTP client construction failure
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }
}

/// Whether an HTTP error status is worth retrying.
fn is_retriable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Map a parsed response onto the submitted edits.
fn build_outcome(edits: &[LocalEdit], response: UploadResponse) -> UploadOutcome {
    let mut outcome = UploadOutcome::new();

    for result in response.results {
        if !edits.iter().any(|e| e.id == result.edit_id) {
            warn!("Server reported unknown edit {}", result.edit_id);
            continue;
        }
        let reason = result.reason.unwrap_or_default();
        let mapped = match result.status {
            WireStatus::Accepted => EditOutcome::Accepted {
                server_id: result.server_id,
            },
            WireStatus::Rejected => EditOutcome::Rejected { reason },
            WireStatus::Error => EditOutcome::ServerError {
                message: reason,
                retriable: result.retriable.unwrap_or(true),
            },
        };
        outcome.insert(result.edit_id, mapped);
    }

    for edit in edits {
        if outcome.get(&edit.id).is_none() {
            outcome.insert(edit.id.clone(), EditOutcome::missing());
        }
    }

    outcome
}

/// The same server error for every edit of a batch.
fn batch_error(edits: &[LocalEdit], message: String, retriable: bool) -> UploadOutcome {
    let mut outcome = UploadOutcome::new();
    for edit in edits {
        outcome.insert(
            edit.id.clone(),
            EditOutcome::ServerError {
                message: message.clone(),
                retriable,
            },
        );
    }
    outcome
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload_batch(&self, edits: &[LocalEdit]) -> Result<UploadOutcome> {
        let url = self.endpoint(EDITS_PATH)?;
        let body = UploadRequest {
            edits: edits
                .iter()
                .map(|e| WireEdit {
                    edit_id: &e.id,
                    kind: e.kind,
                    target_id: &e.target,
                    payload: e.payload.as_ref(),
                    created_at: e.created_at,
                })
                .collect(),
        };

        debug!("Uploading {} edits to {}", edits.len(), url);

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload edits: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Upload batch failed with {}: {}", status, text);
            return Ok(batch_error(
                edits,
                format!("API error: {} - {}", status, text),
                is_retriable_status(status),
            ));
        }

        // The server may have applied the batch. Resubmission relies on it
        // deduplicating by `editId`.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Failed to read upload response: {}", e)))?;

        match serde_json::from_slice::<UploadResponse>(&bytes) {
            Ok(parsed) => Ok(build_outcome(edits, parsed)),
            Err(e) => Ok(batch_error(
                edits,
                format!("Malformed upload response: {}", e),
                true,
            )),
        }
    }

    async fn download_snapshot(
        &self,
        on_progress: &(dyn Fn(TransferProgress) + Send + Sync),
    ) -> Result<DatasetSnapshot> {
        let url = self.endpoint(SNAPSHOT_PATH)?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start download: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::RemoteService {
                message: format!("Download failed: {} - {}", status, text),
                retriable: is_retriable_status(status),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        on_progress(TransferProgress::new(Some(0.0), "Connected"));

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Network(format!("Stream read error: {}", e)))?;
            body.extend_from_slice(&chunk);

            let received = body.len() as u64;
            let fraction = total.map(|t| (received as f64 / t as f64).min(1.0));
            on_progress(TransferProgress::new(
                fraction,
                format!("Downloaded {} KB", received / 1024),
            ));
        }

        serde_json::from_slice(&body).map_err(|e| Error::RemoteService {
            message: format!("Invalid snapshot document: {}", e),
            retriable: false,
        })
    }
}
