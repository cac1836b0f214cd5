//! Persisted fragments of an in-progress recording.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fragment of captured audio owned by the chunk store until its session is cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Session the chunk belongs to
    pub session_id: Uuid,

    /// Position within the session (contiguous, starting at 0)
    pub sequence: u32,

    /// Opaque encoded audio bytes
    pub payload: Vec<u8>,

    /// When the chunk was flushed
    pub captured_at: DateTime<Utc>,
}

impl Chunk {
    /// Stable identifier for a chunk: `{session_id}:{sequence}`
    pub fn id(&self) -> String {
        chunk_id(self.session_id, self.sequence)
    }
}

/// Format a chunk identifier
pub fn chunk_id(session_id: Uuid, sequence: u32) -> String {
    format!("{}:{:010}", session_id, sequence)
}

/// Index line describing a chunk on disk (payload stored separately)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub sequence: u32,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the payload
    pub sha256: String,
}

/// Concatenate chunks in sequence order into a single payload.
///
/// Callers pass chunks as returned by the store; they are re-sorted here so a
/// payload is never assembled out of order.
pub fn concat_chunks(chunks: &[Chunk]) -> Vec<u8> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.sequence);

    let total = ordered.iter().map(|c| c.payload.len()).sum();
    let mut payload = Vec::with_capacity(total);
    for chunk in ordered {
        payload.extend_from_slice(&chunk.payload);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(session_id: Uuid, sequence: u32, payload: &[u8]) -> Chunk {
        Chunk {
            session_id,
            sequence,
            payload: payload.to_vec(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_concat_orders_by_sequence() {
        let session = Uuid::new_v4();
        let chunks = vec![chunk(session, 1, b"llo"), chunk(session, 0, b"He")];

        assert_eq!(concat_chunks(&chunks), b"Hello".to_vec());
    }

    #[test]
    fn test_chunk_id_format() {
        let session = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let c = chunk(session, 7, b"x");
        assert_eq!(c.id(), "550e8400-e29b-41d4-a716-446655440000:0000000007");
    }
}
