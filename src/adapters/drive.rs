//! Google Drive v3 uploader.
//!
//! Folders are looked up by name and parent before being created, so a cold
//! cache reuses folders created by earlier runs. Files are sent in a single
//! `multipart/related` request (metadata part + media part).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::RemoteSettings;
use crate::error::{EngineError, EngineResult};

use super::{AccessToken, FolderBackend, FolderCache, RemoteUploader};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const BOUNDARY: &str = "voxsync_upload_boundary";

/// Where bearer tokens come from
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Whether this source can produce a token at all
    fn has_credentials(&self) -> bool;

    /// Fetch a token
    async fn fetch(&self) -> EngineResult<AccessToken>;
}

/// Token configured out of band (config file or `VOXSYNC_DRIVE_TOKEN`)
pub struct StaticTokenSource {
    token: Option<String>,
    lifetime: Duration,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>, lifetime: Duration) -> Self {
        Self { token, lifetime }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    fn has_credentials(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    async fn fetch(&self) -> EngineResult<AccessToken> {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => Ok(AccessToken::new(token, self.lifetime)),
            _ => Err(EngineError::AuthExpired),
        }
    }
}

/// Response listing files
#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

/// Minimal file resource
#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

/// Google Drive client
pub struct DriveUploader {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    cached_token: tokio::sync::Mutex<Option<AccessToken>>,
    folders: FolderCache,
}

impl DriveUploader {
    pub fn new(tokens: Arc<dyn TokenSource>, root_folder: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
            cached_token: tokio::sync::Mutex::new(None),
            folders: FolderCache::new(root_folder),
        }
    }

    /// Create from resolved remote settings
    pub fn from_settings(settings: &RemoteSettings) -> Self {
        let tokens = StaticTokenSource::new(settings.access_token.clone(), settings.token_lifetime);
        Self::new(Arc::new(tokens), settings.root_folder.clone())
    }

    /// Cached token, fetching a new one once it expires
    async fn bearer(&self) -> EngineResult<String> {
        let mut cached = self.cached_token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
            return Ok(token.token.clone());
        }
        let token = self.tokens.fetch().await?;
        let bearer = token.token.clone();
        *cached = Some(token);
        Ok(bearer)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> EngineResult<reqwest::Response> {
        let bearer = self.bearer().await?;
        let response = request
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| EngineError::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Force a refresh on the next request
            *self.cached_token.lock().await = None;
        }
        Err(EngineError::from_status(status.as_u16(), body))
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> EngineResult<T> {
        response
            .json()
            .await
            .map_err(|e| EngineError::transient(format!("invalid response: {}", e)))
    }
}

/// Escape a name for use inside a Drive query string literal
fn quote_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Build a `multipart/related` upload body
fn multipart_related(metadata: &serde_json::Value, mime_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl FolderBackend for DriveUploader {
    async fn find_child(&self, parent: Option<&str>, name: &str) -> EngineResult<Option<String>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and '{}' in parents and trashed = false",
            quote_query(name),
            FOLDER_MIME,
            quote_query(parent.unwrap_or("root")),
        );

        let request = self
            .client
            .get(format!("{}/files", API_BASE))
            .query(&[("q", query.as_str()), ("fields", "files(id)"), ("spaces", "drive")]);
        let list: FileList = Self::parse(self.send(request).await?).await?;

        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_child(&self, parent: Option<&str>, name: &str) -> EngineResult<String> {
        let request = self
            .client
            .post(format!("{}/files", API_BASE))
            .query(&[("fields", "id")])
            .json(&serde_json::json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [parent.unwrap_or("root")],
            }));
        let file: FileRef = Self::parse(self.send(request).await?).await?;

        debug!(folder = %name, id = %file.id, "Created Drive folder");
        Ok(file.id)
    }
}

#[async_trait]
impl RemoteUploader for DriveUploader {
    fn name(&self) -> &str {
        "drive"
    }

    async fn ensure_folder(&self, path: &[String]) -> EngineResult<String> {
        self.folders.ensure(self, path).await
    }

    async fn upload(
        &self,
        payload: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        folder_id: &str,
    ) -> EngineResult<String> {
        let metadata = serde_json::json!({
            "name": file_name,
            "parents": [folder_id],
        });
        let size = payload.len();
        let body = multipart_related(&metadata, mime_type, &payload);

        let request = self
            .client
            .post(format!("{}/files", UPLOAD_BASE))
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(body);
        let file: FileRef = Self::parse(self.send(request).await?).await?;

        info!(file = %file_name, id = %file.id, size, "Uploaded to Drive");
        Ok(file.id)
    }

    async fn is_authenticated(&self) -> bool {
        let cached = self.cached_token.lock().await;
        cached.as_ref().is_some_and(|t| t.is_valid()) || self.tokens.has_credentials()
    }

    async fn authenticate(&self) -> EngineResult<AccessToken> {
        let token = self.tokens.fetch().await?;
        *self.cached_token.lock().await = Some(token.clone());
        Ok(token)
    }
}
