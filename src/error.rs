//! Error taxonomy for the capture and sync engine.
//!
//! Every fallible engine operation returns [`EngineError`], a closed set of
//! variants callers can match exhaustively. The CLI wraps these in
//! `anyhow::Error` with added context.

use thiserror::Error;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the recorder, stores, and sync queue
#[derive(Debug, Error)]
pub enum EngineError {
    /// The capture device could not be acquired (permission denied, absent)
    #[error("Capture device unavailable: {0}")]
    CaptureUnavailable(String),

    /// Operation is not valid in the current session state
    #[error("Session conflict: {0}")]
    SessionConflict(String),

    /// A chunk store or catalog read/write failed
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Remote credentials were rejected (HTTP 401)
    #[error("Remote authentication expired")]
    AuthExpired,

    /// Remote upload or folder operation failed
    #[error("Upload failed{}: {message}", status_suffix(.status))]
    UploadFailure {
        status: Option<u16>,
        permanent: bool,
        message: String,
    },

    /// Catalog entry does not exist
    #[error("Recording not found: {0}")]
    NotFound(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl EngineError {
    /// Build a transient upload failure without a status code
    pub fn transient(message: impl Into<String>) -> Self {
        Self::UploadFailure {
            status: None,
            permanent: false,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status from the remote store.
    ///
    /// 401 maps to [`EngineError::AuthExpired`]. Other 4xx responses are
    /// permanent except 408 and 429.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == 401 {
            return Self::AuthExpired;
        }
        let permanent = (400..500).contains(&status) && status != 408 && status != 429;
        Self::UploadFailure {
            status: Some(status),
            permanent,
            message: message.into(),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::PersistenceFailure(format!("serialization: {}", err))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::PersistenceFailure(format!("sqlite: {}", err))
    }
}
