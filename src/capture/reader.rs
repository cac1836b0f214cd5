//! Capture from a byte stream (file, FIFO, or stdin).

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{CaptureDevice, CaptureStream, Fragment};
use crate::error::{EngineError, EngineResult};

const DEFAULT_FRAGMENT_SIZE: usize = 16 * 1024;

/// Where a reader device pulls bytes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Stdin,
    Path(PathBuf),
}

impl CaptureSource {
    /// `-` selects stdin, anything else is a path
    pub fn parse(value: &str) -> Self {
        if value == "-" {
            Self::Stdin
        } else {
            Self::Path(PathBuf::from(value))
        }
    }
}

/// Device reading raw encoded audio from a byte stream
pub struct ReaderDevice {
    name: String,
    source: CaptureSource,
    mime_type: String,
    fragment_size: usize,
}

impl ReaderDevice {
    pub fn new(source: CaptureSource, mime_type: impl Into<String>) -> Self {
        let name = match &source {
            CaptureSource::Stdin => "stdin".to_string(),
            CaptureSource::Path(path) => path.display().to_string(),
        };
        Self {
            name,
            source,
            mime_type: mime_type.into(),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }

    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.max(1);
        self
    }

    async fn open(&self) -> EngineResult<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            CaptureSource::Stdin => Ok(Box::new(tokio::io::stdin())),
            CaptureSource::Path(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    EngineError::CaptureUnavailable(format!("{}: {}", path.display(), e))
                })?;
                Ok(Box::new(file))
            }
        }
    }
}

#[async_trait]
impl CaptureDevice for ReaderDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self) -> EngineResult<CaptureStream> {
        let mut reader = self.open().await?;
        let (tx, rx) = mpsc::channel(64);
        let fragment_size = self.fragment_size;
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; fragment_size];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!(device = %name, "Capture source exhausted");
                        break;
                    }
                    Ok(n) => {
                        if tx.send(Fragment::new(buf[..n].to_vec())).await.is_err() {
                            // Stream dropped: session ended
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(device = %name, "Capture read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(CaptureStream::new(rx, self.mime_type.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_source_parse() {
        assert_eq!(CaptureSource::parse("-"), CaptureSource::Stdin);
        assert_eq!(
            CaptureSource::parse("/dev/fifo"),
            CaptureSource::Path(PathBuf::from("/dev/fifo"))
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let device = ReaderDevice::new(
            CaptureSource::Path(PathBuf::from("/nonexistent/mic.raw")),
            "audio/wav",
        );
        assert!(matches!(
            device.acquire().await,
            Err(EngineError::CaptureUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_file_in_fragments() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("input.raw");
        tokio::fs::write(&path, vec![7u8; 10]).await.unwrap();

        let device = ReaderDevice::new(CaptureSource::Path(path), "audio/wav").with_fragment_size(4);
        let mut stream = device.acquire().await.unwrap();

        let mut collected = Vec::new();
        while let Some(fragment) = stream.next_fragment().await {
            assert!(fragment.data.len() <= 4);
            collected.extend(fragment.data);
        }
        assert_eq!(collected, vec![7u8; 10]);
    }
}
