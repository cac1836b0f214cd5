//! Domain types for the capture and sync engine.
//!
//! This module contains the core data structures:
//! - Chunk: Persisted fragment of an in-progress session
//! - Recording: Durable catalog entry with sync state
//! - Session: Recorder lifecycle and published events

pub mod chunk;
pub mod recording;
pub mod session;

// Re-export commonly used types
pub use chunk::{concat_chunks, Chunk, ChunkRecord};
pub use recording::{
    destination_for, extension_for_mime, file_name_for, NewRecording, Recording, RecordingStatus,
    StatusUpdate,
};
pub use session::{SessionEvent, SessionState};
