//! Uploader targeting a local or mounted directory tree.
//!
//! Folder ids are paths relative to the target directory, file ids are the
//! relative path of the written file. Useful for offline setups, synced
//! folders managed by another client, and end-to-end tests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{EngineError, EngineResult};

use super::{AccessToken, FolderBackend, FolderCache, RemoteUploader};

/// Uploads recordings by writing them into a directory
pub struct DirectoryUploader {
    target: PathBuf,
    folders: FolderCache,
}

impl DirectoryUploader {
    pub fn new(target: PathBuf, root_folder: impl Into<String>) -> Self {
        Self {
            target,
            folders: FolderCache::new(root_folder),
        }
    }

    fn resolve(&self, id: &str) -> PathBuf {
        self.target.join(id)
    }
}

/// Reject names that would escape their parent folder
fn checked_name(name: &str) -> EngineResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(EngineError::UploadFailure {
            status: None,
            permanent: true,
            message: format!("invalid remote name '{}'", name),
        });
    }
    Ok(name)
}

fn child_id(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}/{}", parent, name),
        None => name.to_string(),
    }
}

/// IO errors against the target are upload failures, not local persistence ones
fn remote_io(err: std::io::Error) -> EngineError {
    EngineError::transient(format!("directory remote: {}", err))
}

#[async_trait]
impl FolderBackend for DirectoryUploader {
    async fn find_child(&self, parent: Option<&str>, name: &str) -> EngineResult<Option<String>> {
        let id = child_id(parent, checked_name(name)?);
        match tokio::fs::metadata(self.resolve(&id)).await {
            Ok(meta) if meta.is_dir() => Ok(Some(id)),
            Ok(_) => Err(EngineError::UploadFailure {
                status: None,
                permanent: true,
                message: format!("'{}' exists and is not a folder", id),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(remote_io(e)),
        }
    }

    async fn create_child(&self, parent: Option<&str>, name: &str) -> EngineResult<String> {
        let id = child_id(parent, checked_name(name)?);
        tokio::fs::create_dir_all(self.resolve(&id))
            .await
            .map_err(remote_io)?;
        Ok(id)
    }
}

#[async_trait]
impl RemoteUploader for DirectoryUploader {
    fn name(&self) -> &str {
        "directory"
    }

    async fn ensure_folder(&self, path: &[String]) -> EngineResult<String> {
        self.folders.ensure(self, path).await
    }

    async fn upload(
        &self,
        payload: Vec<u8>,
        file_name: &str,
        _mime_type: &str,
        folder_id: &str,
    ) -> EngineResult<String> {
        let name = checked_name(file_name)?;
        let id = child_id(Some(folder_id), name);
        let path = self.resolve(&id);
        let tmp = path.with_file_name(format!("{}.part", name));

        tokio::fs::write(&tmp, &payload).await.map_err(remote_io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(remote_io)?;

        info!(file = %id, size = payload.len(), "Copied recording to directory remote");
        Ok(id)
    }

    async fn is_authenticated(&self) -> bool {
        true
    }

    async fn authenticate(&self) -> EngineResult<AccessToken> {
        Ok(AccessToken::new("local", Duration::from_secs(u32::MAX as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_into_nested_folders() {
        let temp = TempDir::new().unwrap();
        let uploader = DirectoryUploader::new(temp.path().to_path_buf(), "Voice Recordings");

        let folder = uploader
            .ensure_folder(&["2024".to_string(), "03-March".to_string()])
            .await
            .unwrap();
        assert_eq!(folder, "Voice Recordings/2024/03-March");

        let id = uploader
            .upload(b"audio".to_vec(), "a.webm", "audio/webm", &folder)
            .await
            .unwrap();

        let written = std::fs::read(temp.path().join(&id)).unwrap();
        assert_eq!(written, b"audio");
    }

    #[tokio::test]
    async fn test_same_stem_different_extension() {
        let temp = TempDir::new().unwrap();
        let uploader = DirectoryUploader::new(temp.path().to_path_buf(), "root");
        let folder = uploader.ensure_folder(&[]).await.unwrap();

        // A stale temp file of the other upload must not be clobbered
        std::fs::write(temp.path().join("root").join("x.ogg.part"), b"ogg in flight").unwrap();

        let id = uploader
            .upload(b"webm".to_vec(), "x.webm", "audio/webm", &folder)
            .await
            .unwrap();

        assert_eq!(std::fs::read(temp.path().join(&id)).unwrap(), b"webm");
        assert_eq!(
            std::fs::read(temp.path().join("root").join("x.ogg.part")).unwrap(),
            b"ogg in flight"
        );
        assert!(!temp.path().join("root").join("x.webm.part").exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let temp = TempDir::new().unwrap();
        let uploader = DirectoryUploader::new(temp.path().to_path_buf(), "root");

        let err = uploader.ensure_folder(&["..".to_string()]).await.unwrap_err();
        assert!(matches!(err, EngineError::UploadFailure { permanent: true, .. }));
    }
}
