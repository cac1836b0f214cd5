//! Finalized recordings and their sync state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sync status of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Waiting for its first upload attempt
    Pending,

    /// Upload in flight (or interrupted by a crash)
    Uploading,

    /// Uploaded; `remote_file_id` is set
    Synced,

    /// Last attempt failed; retried until the budget is exhausted
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Value of the redundant `synced_flag` column for this status
    pub fn synced_flag(&self) -> bool {
        matches!(self, Self::Synced)
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown recording status '{}'", other)),
        }
    }
}

/// A durable catalog entry (payload is loaded separately)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,

    /// Capture session this recording was assembled from
    pub session_id: Uuid,

    pub captured_at: DateTime<Utc>,
    pub duration_seconds: u64,

    /// Remote folder path segments, outermost first
    pub destination_path: Vec<String>,
    pub file_name: String,

    pub status: RecordingStatus,
    pub synced_flag: bool,
    pub remote_file_id: Option<String>,

    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub size_bytes: u64,
    pub mime_type: String,

    /// Reconstructed from orphaned chunks after a crash
    pub recovered: bool,
}

impl Recording {
    /// Whether the retry budget is exhausted
    pub fn is_dead_lettered(&self, max_retry_count: u32) -> bool {
        self.status == RecordingStatus::Failed && self.retry_count >= max_retry_count
    }

    /// Destination rendered as a slash-separated path
    pub fn destination_display(&self) -> String {
        self.destination_path.join("/")
    }
}

/// A recording ready to be inserted into the catalog
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub session_id: Uuid,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub destination_path: Vec<String>,
    pub file_name: String,
    pub mime_type: String,
    pub recovered: bool,
}

/// Extra fields written alongside a status change
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub remote_file_id: Option<String>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn synced(remote_file_id: impl Into<String>) -> Self {
        Self {
            remote_file_id: Some(remote_file_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            remote_file_id: None,
            error: Some(error.into()),
        }
    }
}

/// File extension for a capture mime type (codec parameters ignored)
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    match base {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/mpeg" => "mp3",
        "audio/flac" => "flac",
        _ => "bin",
    }
}

/// File name derived from the capture start time, e.g. `recording_2024-03-09_14-05-00.webm`
pub fn file_name_for<Tz: TimeZone>(started_at: &DateTime<Tz>, mime_type: &str, recovered: bool) -> String
where
    Tz::Offset: fmt::Display,
{
    let stamp = started_at.format("%Y-%m-%d_%H-%M-%S");
    let suffix = if recovered { "_recovered" } else { "" };
    format!("recording_{}{}.{}", stamp, suffix, extension_for_mime(mime_type))
}

/// Expand a strftime folder template (e.g. `%Y/%m-%B`) into path segments
pub fn destination_for<Tz: TimeZone>(captured_at: &DateTime<Tz>, template: &str) -> Vec<String>
where
    Tz::Offset: fmt::Display,
{
    captured_at
        .format(template)
        .to_string()
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(String::from)
        .collect()
}
