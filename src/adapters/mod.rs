//! Remote store adapters.
//!
//! The sync queue only talks to a [`RemoteUploader`]. Both uploaders resolve
//! destination folders through a shared [`FolderCache`], which walks the
//! folder path one segment at a time over a [`FolderBackend`].

pub mod directory;
pub mod drive;
pub mod network;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::EngineResult;

pub use directory::DirectoryUploader;
pub use drive::{DriveUploader, StaticTokenSource, TokenSource};
pub use network::{Connectivity, ManualConnectivity, TcpProbe};

/// Refresh tokens this long before they actually expire
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Trait for remote stores recordings are uploaded to
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    /// Human-readable remote name
    fn name(&self) -> &str;

    /// Resolve (creating as needed) the folder for a path, returning its id
    async fn ensure_folder(&self, path: &[String]) -> EngineResult<String>;

    /// Upload a payload into a folder, returning the remote file id
    async fn upload(
        &self,
        payload: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        folder_id: &str,
    ) -> EngineResult<String>;

    /// Whether a usable token is at hand
    async fn is_authenticated(&self) -> bool;

    /// Obtain a fresh token (reusing the cached one until it expires)
    async fn authenticate(&self) -> EngineResult<AccessToken>;
}

/// Folder primitives of a remote store
#[async_trait]
pub trait FolderBackend: Send + Sync {
    /// Id of the child folder `name` under `parent` (`None` = store root)
    async fn find_child(&self, parent: Option<&str>, name: &str) -> EngineResult<Option<String>>;

    /// Create the child folder and return its id
    async fn create_child(&self, parent: Option<&str>, name: &str) -> EngineResult<String>;
}

/// Caches `path -> folder_id`, rooted at a fixed top-level folder.
///
/// Creation is serialized so concurrent callers never create the same
/// folder twice.
pub struct FolderCache {
    root_folder: String,
    folders: Mutex<HashMap<Vec<String>, String>>,
    creation: tokio::sync::Mutex<()>,
}

impl FolderCache {
    pub fn new(root_folder: impl Into<String>) -> Self {
        Self {
            root_folder: root_folder.into(),
            folders: Mutex::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
        }
    }

    fn cached(&self, path: &[String]) -> Option<String> {
        let folders = match self.folders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        folders.get(path).cloned()
    }

    fn remember(&self, path: Vec<String>, id: String) {
        let mut folders = match self.folders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        folders.insert(path, id);
    }

    /// Resolve `path` below the root folder, creating missing segments
    pub async fn ensure<B>(&self, backend: &B, path: &[String]) -> EngineResult<String>
    where
        B: FolderBackend + ?Sized,
    {
        if let Some(id) = self.cached(path) {
            return Ok(id);
        }

        let _creating = self.creation.lock().await;

        // The empty prefix is the root folder itself
        let mut parent: Option<String> = None;
        for depth in 0..=path.len() {
            let prefix = &path[..depth];
            if let Some(id) = self.cached(prefix) {
                parent = Some(id);
                continue;
            }

            let name = match prefix.last() {
                Some(segment) => segment.as_str(),
                None => self.root_folder.as_str(),
            };
            let id = match backend.find_child(parent.as_deref(), name).await? {
                Some(id) => id,
                None => {
                    debug!(folder = %name, "Creating remote folder");
                    backend.create_child(parent.as_deref(), name).await?
                }
            };

            self.remember(prefix.to_vec(), id.clone());
            parent = Some(id);
        }

        // Loop runs at least once, for the root
        Ok(parent.unwrap_or_default())
    }
}

/// A bearer token with its expiry
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Usable at `now`, with a safety margin before expiry
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now + TOKEN_EXPIRY_SKEW < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }
}
