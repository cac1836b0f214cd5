//! Recording session state and the events a session publishes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active session
    Idle,

    /// Capturing and flushing on a timer
    Recording,

    /// Capture suspended; device fragments are discarded
    Paused,

    /// Finalizing into the catalog
    Stopping,

    /// Reconstructing orphaned sessions at startup
    Recovering,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Events published by the recorder, delivered in order and never dropped.
///
/// Level updates are published separately on a coalescing watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: Option<Uuid>,
        state: SessionState,
    },

    /// A chunk reached the chunk store
    ChunkSaved {
        session_id: Uuid,
        sequence: u32,
        size_bytes: u64,
    },

    /// The capture device ran dry; the session stays open until stopped
    InputEnded { session_id: Uuid },

    /// A non-fatal failure (e.g. a flush that will be retried)
    Error { session_id: Option<Uuid>, message: String },

    /// A session produced a catalog entry
    Finalized {
        session_id: Uuid,
        recording_id: String,
        recovered: bool,
    },
}
