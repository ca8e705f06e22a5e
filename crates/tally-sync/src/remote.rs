//! # Remote Store Client
//!
//! Whole-document download and upload against the per-user remote store.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   RemoteStore (trait)                                                   │
//! │        │                                                                │
//! │        ├── HttpRemoteStore    GET/PUT {base}/v1/users/{user}/ledger     │
//! │        │                      bearer auth; 401/403 => Auth              │
//! │        │                      5xx / connect failure => Network          │
//! │        │                                                                │
//! │        ├── FileRemoteStore    one JSON file on a shared path            │
//! │        │                                                                │
//! │        └── MemoryRemoteStore  in-process, with fault injection          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backends do a single attempt per call. Retry and per-attempt timeouts
//! belong to the orchestrator.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::{RemoteBackend, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::wire::RemoteDocument;

/// Download and upload of the whole remote document.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches the current document. A user with no document yet gets an
    /// empty one.
    async fn download(&self, token: &str) -> SyncResult<RemoteDocument>;

    /// Overwrites the document. The store assigns `lastSyncAt`.
    async fn upload(&self, token: &str, document: &RemoteDocument) -> SyncResult<()>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the backend selected in `config`.
pub fn from_config(config: &SyncConfig) -> SyncResult<Arc<dyn RemoteStore>> {
    match config.remote.backend {
        RemoteBackend::Http => {
            let base = config
                .remote
                .url
                .as_deref()
                .ok_or_else(|| SyncError::InvalidConfig("remote.url is required".into()))?;
            Ok(Arc::new(HttpRemoteStore::new(
                base,
                &config.remote.user_id,
                config.request_timeout(),
            )?))
        }
        RemoteBackend::File => {
            let path = config
                .remote
                .path
                .clone()
                .ok_or_else(|| SyncError::InvalidConfig("remote.path is required".into()))?;
            Ok(Arc::new(FileRemoteStore::new(path)))
        }
        RemoteBackend::Memory => Ok(Arc::new(MemoryRemoteStore::new())),
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// Remote store behind an HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    ledger_url: Url,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, user_id: &str, timeout: Duration) -> SyncResult<Self> {
        let base = Url::parse(base_url)?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base.scheme()
            )));
        }
        let ledger_url = base.join(&format!("v1/users/{}/ledger", user_id))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(HttpRemoteStore { client, ledger_url })
    }

    pub fn ledger_url(&self) -> &Url {
        &self.ledger_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        if token.is_empty() {
            request
        } else {
            request.bearer_auth(token)
        }
    }
}

/// Maps a non-success status to the sync error taxonomy.
fn status_error(status: reqwest::StatusCode, action: &str) -> SyncError {
    match status.as_u16() {
        401 | 403 => SyncError::Auth(format!("{} refused: HTTP {}", action, status)),
        408 | 429 => SyncError::Network(format!("{} throttled: HTTP {}", action, status)),
        s if s >= 500 => SyncError::Network(format!("{} failed: HTTP {}", action, status)),
        _ => SyncError::Internal(format!("{} rejected: HTTP {}", action, status)),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn download(&self, token: &str) -> SyncResult<RemoteDocument> {
        debug!(url = %self.ledger_url, "Downloading remote document");

        let response = self
            .authorize(self.client.get(self.ledger_url.clone()), token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            info!("No remote document yet");
            return Ok(RemoteDocument::default());
        }
        if !status.is_success() {
            return Err(status_error(status, "download"));
        }

        let document: RemoteDocument = response.json().await?;
        Ok(document)
    }

    async fn upload(&self, token: &str, document: &RemoteDocument) -> SyncResult<()> {
        debug!(
            url = %self.ledger_url,
            records = document.record_count(),
            "Uploading remote document"
        );

        let response = self
            .authorize(self.client.put(self.ledger_url.clone()), token)
            .json(document)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "upload"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// =============================================================================
// File
// =============================================================================

/// Remote store kept as one JSON file, typically in a synced folder.
#[derive(Debug, Clone)]
pub struct FileRemoteStore {
    path: PathBuf,
}

impl FileRemoteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRemoteStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_document(path: &Path) -> SyncResult<RemoteDocument> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoteDocument::default()),
        Err(e) => Err(SyncError::Network(format!("{}: {}", path.display(), e))),
    }
}

fn write_document(path: &Path, document: &RemoteDocument) -> SyncResult<()> {
    let text = serde_json::to_string_pretty(document)?;
    let io_err = |e: std::io::Error| SyncError::Network(format!("{}: {}", path.display(), e));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    // Write beside the target and rename so readers never see half a file.
    let staging = path.with_extension("json.partial");
    std::fs::write(&staging, text).map_err(io_err)?;
    std::fs::rename(&staging, path).map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl RemoteStore for FileRemoteStore {
    async fn download(&self, _token: &str) -> SyncResult<RemoteDocument> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_document(&path))
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))?
    }

    async fn upload(&self, _token: &str, document: &RemoteDocument) -> SyncResult<()> {
        let path = self.path.clone();
        let mut document = document.clone();
        document.last_sync_at = Some(Utc::now());

        tokio::task::spawn_blocking(move || write_document(&path, &document))
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))?
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// =============================================================================
// Memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    document: RemoteDocument,
    fail_next: u32,
    fail_uploads: u32,
    reject_auth: bool,
    delay: Option<Duration>,
    downloads: u32,
    uploads: u32,
}

/// In-process remote store shared by every replica holding a clone.
///
/// Faults are injected per call: `fail_next(n)` makes the next `n` calls fail
/// with a network error, `fail_uploads(n)` does the same for uploads only,
/// `reject_auth(true)` answers every call with an auth
/// error, and `set_delay` stalls calls to provoke timeouts.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self) -> RemoteDocument {
        self.state.lock().await.document.clone()
    }

    /// Replaces the stored document as-is, bypassing `lastSyncAt` stamping.
    pub async fn set_document(&self, document: RemoteDocument) {
        self.state.lock().await.document = document;
    }

    pub async fn fail_next(&self, calls: u32) {
        self.state.lock().await.fail_next = calls;
    }

    pub async fn fail_uploads(&self, calls: u32) {
        self.state.lock().await.fail_uploads = calls;
    }

    pub async fn reject_auth(&self, reject: bool) {
        self.state.lock().await.reject_auth = reject;
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.delay = delay;
    }

    pub async fn download_count(&self) -> u32 {
        self.state.lock().await.downloads
    }

    pub async fn upload_count(&self) -> u32 {
        self.state.lock().await.uploads
    }

    /// Counts the call and applies injected faults.
    async fn enter(&self, upload: bool) -> SyncResult<()> {
        let delay = {
            let mut state = self.state.lock().await;
            if upload {
                state.uploads += 1;
            } else {
                state.downloads += 1;
            }
            if state.reject_auth {
                return Err(SyncError::Auth("credential rejected".into()));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(SyncError::Network("injected failure".into()));
            }
            if upload && state.fail_uploads > 0 {
                state.fail_uploads -= 1;
                return Err(SyncError::Network("injected upload failure".into()));
            }
            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn download(&self, _token: &str) -> SyncResult<RemoteDocument> {
        self.enter(false).await?;
        Ok(self.state.lock().await.document.clone())
    }

    async fn upload(&self, _token: &str, document: &RemoteDocument) -> SyncResult<()> {
        self.enter(true).await?;
        let mut document = document.clone();
        document.last_sync_at = Some(Utc::now());
        self.state.lock().await.document = document;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
