//! Append-only chunk log with file-based persistence.
//!
//! Each session owns a directory holding its payload files and an
//! `index.jsonl` log. A payload is written to a temp file and renamed into
//! place before its index line is appended, so a chunk is either fully
//! present (index line, payload file, matching digest) or treated as absent.

use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::chunk::chunk_id;
use crate::domain::{Chunk, ChunkRecord};
use crate::error::{EngineError, EngineResult};

const INDEX_FILE: &str = "index.jsonl";

/// Persistent log of recording fragments, keyed by session and sequence
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persist a chunk; `sequence` must be the next one for the session
    async fn append(&self, session_id: Uuid, sequence: u32, payload: &[u8]) -> EngineResult<String>;

    /// All chunks of a session, ascending by sequence
    async fn list_by_session(&self, session_id: Uuid) -> EngineResult<Vec<Chunk>>;

    /// Delete every chunk of a session (no-op when none exist)
    async fn clear_session(&self, session_id: Uuid) -> EngineResult<()>;

    /// Distinct sessions that currently have chunk state on disk
    async fn list_orphan_sessions(&self) -> EngineResult<BTreeSet<Uuid>>;
}

/// File-based chunk store rooted at a directory (~/.voxsync/chunks)
pub struct FileChunkStore {
    root: PathBuf,
}

impl FileChunkStore {
    /// Create a store rooted at `root` (created lazily on first append)
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    fn payload_path(dir: &Path, sequence: u32) -> PathBuf {
        dir.join(format!("{:010}.chunk", sequence))
    }

    /// Replay the index of a session directory, skipping unreadable lines
    async fn read_index(dir: &Path) -> EngineResult<Vec<ChunkRecord>> {
        let index_path = dir.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&index_path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChunkRecord>(&line) {
                Ok(record) => records.push(record),
                // A torn final line from a crash mid-append
                Err(e) => warn!(path = %index_path.display(), "Skipping unreadable chunk index line: {}", e),
            }
        }

        Ok(records)
    }

    async fn append_index(dir: &Path, record: &ChunkRecord) -> EngineResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(INDEX_FILE))
            .await?;

        // Terminate a torn tail so the new record starts on its own line
        let mut line = String::new();
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.push('\n');
            }
        }

        line.push_str(&serde_json::to_string(record)?);
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn append(&self, session_id: Uuid, sequence: u32, payload: &[u8]) -> EngineResult<String> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;

        let existing = Self::read_index(&dir).await?;
        let digest = sha256_hex(payload);

        // Retried append of an already-acknowledged chunk
        if let Some(record) = existing.iter().find(|r| r.sequence == sequence) {
            if record.sha256 == digest {
                return Ok(chunk_id(session_id, sequence));
            }
        }

        let expected = existing
            .iter()
            .map(|r| r.sequence + 1)
            .max()
            .unwrap_or(0);
        if sequence != expected {
            return Err(EngineError::PersistenceFailure(format!(
                "chunk {} out of order for session {} (expected sequence {})",
                sequence, session_id, expected
            )));
        }

        let final_path = Self::payload_path(&dir, sequence);
        let temp_path = final_path.with_extension("chunk.tmp");

        let mut file = File::create(&temp_path).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await?;

        let record = ChunkRecord {
            sequence,
            captured_at: Utc::now(),
            size_bytes: payload.len() as u64,
            sha256: digest,
        };
        Self::append_index(&dir, &record).await?;

        debug!(%session_id, sequence, bytes = payload.len(), "Chunk appended");
        Ok(chunk_id(session_id, sequence))
    }

    async fn list_by_session(&self, session_id: Uuid) -> EngineResult<Vec<Chunk>> {
        let dir = self.session_dir(session_id);
        let mut records = Self::read_index(&dir).await?;
        records.sort_by_key(|r| r.sequence);
        records.dedup_by_key(|r| r.sequence);

        let mut chunks = Vec::with_capacity(records.len());
        for record in records {
            let path = Self::payload_path(&dir, record.sequence);
            let payload = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(%session_id, sequence = record.sequence, "Chunk payload missing, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if sha256_hex(&payload) != record.sha256 {
                warn!(%session_id, sequence = record.sequence, "Chunk digest mismatch, skipping");
                continue;
            }

            chunks.push(Chunk {
                session_id,
                sequence: record.sequence,
                payload,
                captured_at: record.captured_at,
            });
        }

        Ok(chunks)
    }

    async fn clear_session(&self, session_id: Uuid) -> EngineResult<()> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => {
                debug!(%session_id, "Session chunks cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_orphan_sessions(&self) -> EngineResult<BTreeSet<Uuid>> {
        let mut sessions = BTreeSet::new();

        if !self.root.exists() {
            return Ok(sessions);
        }

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = Uuid::parse_str(name) {
                        sessions.insert(id);
                    }
                }
            }
        }

        Ok(sessions)
    }
}

/// Volatile chunk store, for hosts without durable storage and for tests
#[derive(Default)]
pub struct MemoryChunkStore {
    sessions: Mutex<BTreeMap<Uuid, BTreeMap<u32, Chunk>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uuid, BTreeMap<u32, Chunk>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn append(&self, session_id: Uuid, sequence: u32, payload: &[u8]) -> EngineResult<String> {
        let mut sessions = self.lock();
        let chunks = sessions.entry(session_id).or_default();

        if let Some(existing) = chunks.get(&sequence) {
            if existing.payload == payload {
                return Ok(chunk_id(session_id, sequence));
            }
        }

        let expected = chunks.keys().next_back().map(|s| s + 1).unwrap_or(0);
        if sequence != expected {
            return Err(EngineError::PersistenceFailure(format!(
                "chunk {} out of order for session {} (expected sequence {})",
                sequence, session_id, expected
            )));
        }

        chunks.insert(
            sequence,
            Chunk {
                session_id,
                sequence,
                payload: payload.to_vec(),
                captured_at: Utc::now(),
            },
        );
        Ok(chunk_id(session_id, sequence))
    }

    async fn list_by_session(&self, session_id: Uuid) -> EngineResult<Vec<Chunk>> {
        Ok(self
            .lock()
            .get(&session_id)
            .map(|chunks| chunks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_session(&self, session_id: Uuid) -> EngineResult<()> {
        self.lock().remove(&session_id);
        Ok(())
    }

    async fn list_orphan_sessions(&self) -> EngineResult<BTreeSet<Uuid>> {
        Ok(self.lock().keys().copied().collect())
    }
}

/// Hex-encoded SHA-256 digest of a payload
pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FileChunkStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = FileChunkStore::new(temp.path().join("chunks"));
        (store, temp)
    }

    #[tokio::test]
    async fn test_append_and_list_in_order() {
        let (store, _temp) = create_test_store();
        let session = Uuid::new_v4();

        let parts: [&[u8]; 3] = [b"a", b"bb", b"ccc"];
        for (seq, part) in parts.iter().enumerate() {
            store.append(session, seq as u32, part).await.unwrap();
        }

        let chunks = store.list_by_session(session).await.unwrap();
        let sequences: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(chunks[2].payload, b"ccc".to_vec());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_gapped_sequence() {
        let (store, _temp) = create_test_store();
        let session = Uuid::new_v4();

        store.append(session, 0, b"first").await.unwrap();

        let dup = store.append(session, 0, b"again").await;
        assert!(matches!(dup, Err(EngineError::PersistenceFailure(_))));

        let gap = store.append(session, 2, b"skip").await;
        assert!(matches!(gap, Err(EngineError::PersistenceFailure(_))));

        let chunks = store.list_by_session(session).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload, b"first".to_vec());
    }

    #[tokio::test]
    async fn test_retried_append_is_idempotent() {
        let (store, _temp) = create_test_store();
        let session = Uuid::new_v4();

        let first = store.append(session, 0, b"same").await.unwrap();
        let again = store.append(session, 0, b"same").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.list_by_session(session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryChunkStore::new();
        let session = Uuid::new_v4();

        store.append(session, 0, b"He").await.unwrap();
        store.append(session, 1, b"llo").await.unwrap();
        assert!(store.append(session, 3, b"gap").await.is_err());

        let chunks = store.list_by_session(session).await.unwrap();
        assert_eq!(crate::domain::concat_chunks(&chunks), b"Hello".to_vec());
        assert!(store.list_orphan_sessions().await.unwrap().contains(&session));

        store.clear_session(session).await.unwrap();
        store.clear_session(session).await.unwrap();
        assert!(store.list_by_session(session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_session_is_idempotent() {
        let (store, _temp) = create_test_store();
        let session = Uuid::new_v4();

        // Nothing stored yet
        store.clear_session(session).await.unwrap();

        store.append(session, 0, b"data").await.unwrap();
        store.clear_session(session).await.unwrap();
        store.clear_session(session).await.unwrap();

        assert!(store.list_by_session(session).await.unwrap().is_empty());
        assert!(store.list_orphan_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_orphan_sessions() {
        let (store, temp) = create_test_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, 0, b"a").await.unwrap();
        store.append(b, 0, b"b").await.unwrap();

        // Stray non-session directory is ignored
        std::fs::create_dir_all(temp.path().join("chunks").join("not-a-session")).unwrap();

        let orphans = store.list_orphan_sessions().await.unwrap();
        assert_eq!(orphans.len(), 2);
        assert!(orphans.contains(&a));
        assert!(orphans.contains(&b));
    }

    #[tokio::test]
    async fn test_corrupt_chunk_treated_as_absent() {
        let (store, _temp) = create_test_store();
        let session = Uuid::new_v4();

        store.append(session, 0, b"good").await.unwrap();
        store.append(session, 1, b"will be damaged").await.unwrap();

        let dir = store.session_dir(session);
        std::fs::write(FileChunkStore::payload_path(&dir, 1), b"garbage").unwrap();

        // Torn trailing index line from an interrupted append
        let mut index = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.join(INDEX_FILE))
            .unwrap();
        std::io::Write::write_all(&mut index, b"{\"sequence\": 2, \"capt").unwrap();

        let chunks = store.list_by_session(session).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload, b"good".to_vec());
    }

    #[tokio::test]
    async fn test_append_after_torn_index_line() {
        let (store, _temp) = create_test_store();
        let session = Uuid::new_v4();

        store.append(session, 0, b"zero").await.unwrap();

        // An index write cut short before its newline
        let dir = store.session_dir(session);
        let mut index = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.join(INDEX_FILE))
            .unwrap();
        std::io::Write::write_all(&mut index, b"{\"sequence\":1,\"capt").unwrap();

        store.append(session, 1, b"one").await.unwrap();
        store.append(session, 2, b"two").await.unwrap();

        let chunks = store.list_by_session(session).await.unwrap();
        let sequences: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(crate::domain::concat_chunks(&chunks), b"zeroonetwo".to_vec());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
