//! Canonical on-disk locations for engine state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Layout
//!
//! ```text
//! ~/.voxsync/
//! ├── chunks/<session_id>/      # Crash-protected chunk log per session
//! │   ├── index.jsonl
//! │   └── 0000000000.chunk
//! ├── catalog.db                # Finalized recordings (SQLite)
//! ├── settings.json             # Capture device, setup flag
//! ├── recorder.lock             # Held while a session is active
//! └── outbox/                   # Default target of the directory remote
//! ```

use std::path::{Path, PathBuf};

/// Chunk log root under a given home
pub fn chunks_dir_in(home: &Path) -> PathBuf {
    home.join("chunks")
}

/// Catalog database under a given home
pub fn catalog_db_in(home: &Path) -> PathBuf {
    home.join("catalog.db")
}

/// Settings file under a given home
pub fn settings_file_in(home: &Path) -> PathBuf {
    home.join("settings.json")
}

/// Recorder lock file under a given home
pub fn recorder_lock_in(home: &Path) -> PathBuf {
    home.join("recorder.lock")
}
