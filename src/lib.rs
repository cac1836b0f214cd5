//! voxsync - Crash-safe voice capture with background sync
//!
//! Captured audio is flushed into an append-only chunk log every few
//! seconds, so a crash loses at most one flush interval. Finished sessions
//! become catalog entries that a single-flight sync queue uploads to a
//! remote store, retrying failures up to a fixed budget.
//!
//! # Architecture
//!
//! ```text
//! CaptureDevice ─▶ Recorder ─▶ ChunkStore (per session, crash-safe)
//!                     │ stop / recover
//!                     ▼
//!               RecordingCatalog (SQLite) ─▶ SyncQueue ─▶ RemoteUploader
//! ```
//!
//! # Modules
//!
//! - `capture`: Capture device abstraction (reader and channel devices)
//! - `core`: Chunk store, catalog, recorder, sync queue, backoff
//! - `adapters`: Remote uploaders (Drive, directory) and connectivity
//! - `domain`: Data structures (Chunk, Recording, SessionState)
//! - `settings`: Persisted user settings
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Record raw audio piped from another program
//! arecord -f S16_LE -r 16000 -t raw | voxsync record --input -
//!
//! # Upload everything pending
//! voxsync sync --once
//! ```

pub mod adapters;
pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod settings;

// Re-export main types at crate root for convenience
pub use core::{Recorder, SqliteCatalog, SyncQueue};
pub use domain::{Recording, RecordingStatus, SessionEvent, SessionState};
pub use error::{EngineError, EngineResult};
