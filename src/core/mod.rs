//! Core capture and sync engine.
//!
//! This module contains:
//! - ChunkStore: Append-only, crash-safe chunk log per session
//! - RecordingCatalog: Durable catalog of finalized recordings (SQLite)
//! - Recorder: Session state machine and crash recovery
//! - SyncQueue: Single-flight upload passes with retry bookkeeping
//! - BackoffPolicy: When failed uploads become due again

pub mod catalog;
pub mod chunk_store;
pub mod recorder;
pub mod retry;
pub mod sync_queue;

// Re-export commonly used types
pub use catalog::{CatalogStats, RecordingCatalog, SqliteCatalog};
pub use chunk_store::{ChunkStore, FileChunkStore, MemoryChunkStore};
pub use recorder::{Recorder, RecorderConfig, RecoveryReport, SessionSnapshot};
pub use retry::BackoffPolicy;
pub use sync_queue::{
    PassOutcome, SkipReason, SyncIndicator, SyncNotifier, SyncQueue, SyncQueueConfig, SyncTrigger,
};
