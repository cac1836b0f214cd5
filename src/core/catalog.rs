//! Durable catalog of finalized recordings.
//!
//! The catalog is the only place sync status and retry metadata live. Status
//! changes go through [`RecordingCatalog::update_status`], which keeps the
//! redundant `synced_flag` column consistent with `status`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{NewRecording, Recording, RecordingStatus, StatusUpdate};
use crate::error::{EngineError, EngineResult};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS recordings (
    id               TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    payload          BLOB NOT NULL,
    captured_at      TEXT NOT NULL,
    duration_seconds INTEGER NOT NULL,
    destination_path TEXT NOT NULL,
    file_name        TEXT NOT NULL,
    status           TEXT NOT NULL,
    synced_flag      INTEGER NOT NULL DEFAULT 0,
    remote_file_id   TEXT,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    last_retry_at    TEXT,
    last_error       TEXT,
    size_bytes       INTEGER NOT NULL,
    mime_type        TEXT NOT NULL,
    recovered        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_recordings_sync ON recordings (synced_flag, status);
CREATE INDEX IF NOT EXISTS idx_recordings_captured_at ON recordings (captured_at);
CREATE INDEX IF NOT EXISTS idx_recordings_session ON recordings (session_id);
";

const RECORDING_COLUMNS: &str = "id, session_id, captured_at, duration_seconds, destination_path, \
     file_name, status, synced_flag, remote_file_id, retry_count, last_retry_at, last_error, \
     size_bytes, mime_type, recovered";

/// Durable record of finalized recordings and their sync state
#[async_trait]
pub trait RecordingCatalog: Send + Sync {
    /// Insert a new `pending` entry, returning its id
    async fn insert(&self, recording: NewRecording) -> EngineResult<String>;

    async fn get(&self, id: &str) -> EngineResult<Option<Recording>>;

    /// Load the stored payload of an entry
    async fn payload(&self, id: &str) -> EngineResult<Vec<u8>>;

    /// Entry created from a given capture session, if any
    async fn find_by_session(&self, session_id: Uuid) -> EngineResult<Option<Recording>>;

    /// All entries, newest capture first
    async fn list_all(&self) -> EngineResult<Vec<Recording>>;

    /// Pending or failed entries still within the retry budget, oldest first
    async fn list_pending_or_retryable(&self) -> EngineResult<Vec<Recording>>;

    /// The single status mutation path
    async fn update_status(
        &self,
        id: &str,
        status: RecordingStatus,
        extra: StatusUpdate,
    ) -> EngineResult<()>;

    /// Bump the retry counter and stamp `last_retry_at`, returning the new count
    async fn increment_retry(&self, id: &str) -> EngineResult<u32>;

    /// Manual retry: back to `pending` with a fresh retry budget.
    /// Returns false for entries that are already synced.
    async fn reset_for_retry(&self, id: &str) -> EngineResult<bool>;

    /// Return entries left `uploading` by an interrupted pass to `pending`
    async fn requeue_interrupted(&self) -> EngineResult<usize>;

    /// Remove synced entries, returning how many were removed
    async fn delete_synced(&self) -> EngineResult<usize>;

    /// Number of entries the sync queue would still attempt
    async fn count_pending(&self) -> EngineResult<usize>;

    async fn stats(&self) -> EngineResult<CatalogStats>;

    /// Dead-letter boundary applied by this catalog
    fn max_retry_count(&self) -> u32;
}

/// Per-status counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub pending: usize,
    pub uploading: usize,
    pub synced: usize,
    pub failed: usize,
    /// Failed entries whose retry budget is exhausted
    pub dead_lettered: usize,
}

impl CatalogStats {
    pub fn total(&self) -> usize {
        self.pending + self.uploading + self.synced + self.failed
    }
}

/// SQLite-backed catalog
#[derive(Clone)]
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
    max_retry_count: u32,
}

impl SqliteCatalog {
    /// Open (or create) the catalog database at `path`
    pub fn open(path: &Path, max_retry_count: u32) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_retry_count,
        })
    }

    /// Volatile catalog for tests and dry runs
    pub fn open_in_memory(max_retry_count: u32) -> EngineResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_retry_count,
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn execute<F, T>(&self, task: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            task(&mut guard)
        })
        .await
        .map_err(|e| EngineError::PersistenceFailure(format!("catalog task failed: {}", e)))?
    }
}

fn run_migrations(conn: &mut Connection) -> EngineResult<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(EngineError::PersistenceFailure(format!(
            "catalog version ({}) is newer than supported schema ({})",
            version, CURRENT_SCHEMA_VERSION
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    let mut current = version;
    while current < CURRENT_SCHEMA_VERSION {
        current += 1;
        apply_migration(&tx, current)?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    info!(version = CURRENT_SCHEMA_VERSION, "Catalog schema migrated");
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> EngineResult<()> {
    match version {
        1 => Ok(tx.execute_batch(SCHEMA_V1)?),
        other => Err(EngineError::PersistenceFailure(format!(
            "no migration defined for catalog version {}",
            other
        ))),
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str, field: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::PersistenceFailure(format!("invalid {} '{}': {}", field, value, e)))
}

fn to_u64(value: i64, field: &str) -> EngineResult<u64> {
    u64::try_from(value)
        .map_err(|_| EngineError::PersistenceFailure(format!("{} is negative: {}", field, value)))
}

fn row_to_recording(row: &Row) -> EngineResult<Recording> {
    let session_id: String = row.get("session_id")?;
    let captured_at: String = row.get("captured_at")?;
    let destination_path: String = row.get("destination_path")?;
    let status: String = row.get("status")?;
    let last_retry_at: Option<String> = row.get("last_retry_at")?;
    let retry_count: i64 = row.get("retry_count")?;

    Ok(Recording {
        id: row.get("id")?,
        session_id: Uuid::parse_str(&session_id).map_err(|e| {
            EngineError::PersistenceFailure(format!("invalid session_id '{}': {}", session_id, e))
        })?,
        captured_at: parse_timestamp(&captured_at, "captured_at")?,
        duration_seconds: to_u64(row.get("duration_seconds")?, "duration_seconds")?,
        destination_path: serde_json::from_str(&destination_path)?,
        file_name: row.get("file_name")?,
        status: status.parse().map_err(EngineError::PersistenceFailure)?,
        synced_flag: row.get::<_, i64>("synced_flag")? != 0,
        remote_file_id: row.get("remote_file_id")?,
        retry_count: u32::try_from(retry_count).map_err(|_| {
            EngineError::PersistenceFailure(format!("invalid retry_count {}", retry_count))
        })?,
        last_retry_at: last_retry_at
            .map(|v| parse_timestamp(&v, "last_retry_at"))
            .transpose()?,
        last_error: row.get("last_error")?,
        size_bytes: to_u64(row.get("size_bytes")?, "size_bytes")?,
        mime_type: row.get("mime_type")?,
        recovered: row.get::<_, i64>("recovered")? != 0,
    })
}

fn query_recordings(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> EngineResult<Vec<Recording>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut recordings = Vec::new();
    while let Some(row) = rows.next()? {
        recordings.push(row_to_recording(row)?);
    }
    Ok(recordings)
}

fn retryable_predicate() -> String {
    format!(
        "status IN ('{}', '{}') AND retry_count < ?1",
        RecordingStatus::Pending.as_str(),
        RecordingStatus::Failed.as_str()
    )
}

#[async_trait]
impl RecordingCatalog for SqliteCatalog {
    async fn insert(&self, recording: NewRecording) -> EngineResult<String> {
        let id = Uuid::new_v4().to_string();
        let row_id = id.clone();

        self.execute(move |conn| {
            let destination = serde_json::to_string(&recording.destination_path)?;
            let size_bytes = i64::try_from(recording.payload.len()).map_err(|_| {
                EngineError::PersistenceFailure("payload exceeds SQLite INTEGER range".to_string())
            })?;
            let duration = i64::try_from(recording.duration_seconds).map_err(|_| {
                EngineError::PersistenceFailure("duration exceeds SQLite INTEGER range".to_string())
            })?;

            conn.execute(
                "INSERT INTO recordings (id, session_id, payload, captured_at, duration_seconds,
                     destination_path, file_name, status, synced_flag, remote_file_id, retry_count,
                     last_retry_at, last_error, size_bytes, mime_type, recovered)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, 0, NULL, NULL, ?9, ?10, ?11)",
                params![
                    row_id,
                    recording.session_id.to_string(),
                    recording.payload,
                    format_timestamp(&recording.captured_at),
                    duration,
                    destination,
                    recording.file_name,
                    RecordingStatus::Pending.as_str(),
                    size_bytes,
                    recording.mime_type,
                    recording.recovered as i64,
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!(%id, "Recording cataloged");
        Ok(id)
    }

    async fn get(&self, id: &str) -> EngineResult<Option<Recording>> {
        let id = id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {} FROM recordings WHERE id = ?1", RECORDING_COLUMNS);
            Ok(query_recordings(conn, &sql, params![id])?.into_iter().next())
        })
        .await
    }

    async fn payload(&self, id: &str) -> EngineResult<Vec<u8>> {
        let id = id.to_string();
        self.execute(move |conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM recordings WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            payload.ok_or(EngineError::NotFound(id))
        })
        .await
    }

    async fn find_by_session(&self, session_id: Uuid) -> EngineResult<Option<Recording>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {} FROM recordings WHERE session_id = ?1 LIMIT 1",
                RECORDING_COLUMNS
            );
            Ok(query_recordings(conn, &sql, params![session_id.to_string()])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn list_all(&self) -> EngineResult<Vec<Recording>> {
        self.execute(|conn| {
            let sql = format!(
                "SELECT {} FROM recordings ORDER BY captured_at DESC",
                RECORDING_COLUMNS
            );
            query_recordings(conn, &sql, [])
        })
        .await
    }

    async fn list_pending_or_retryable(&self) -> EngineResult<Vec<Recording>> {
        let max = self.max_retry_count;
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {} FROM recordings WHERE synced_flag = 0 AND {} ORDER BY captured_at ASC",
                RECORDING_COLUMNS,
                retryable_predicate()
            );
            query_recordings(conn, &sql, params![max])
        })
        .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: RecordingStatus,
        extra: StatusUpdate,
    ) -> EngineResult<()> {
        if status == RecordingStatus::Synced && extra.remote_file_id.is_none() {
            return Err(EngineError::PersistenceFailure(format!(
                "recording {} cannot be marked synced without a remote file id",
                id
            )));
        }

        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE recordings
                 SET status = ?1,
                     synced_flag = ?2,
                     remote_file_id = COALESCE(?3, remote_file_id),
                     last_error = CASE WHEN ?1 = 'synced' THEN NULL ELSE COALESCE(?4, last_error) END
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    status.synced_flag() as i64,
                    extra.remote_file_id,
                    extra.error,
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn increment_retry(&self, id: &str) -> EngineResult<u32> {
        let id = id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE recordings SET retry_count = retry_count + 1, last_retry_at = ?1 WHERE id = ?2",
                params![format_timestamp(&Utc::now()), id],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(id));
            }
            let count: i64 = tx.query_row(
                "SELECT retry_count FROM recordings WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            u32::try_from(count)
                .map_err(|_| EngineError::PersistenceFailure(format!("invalid retry_count {}", count)))
        })
        .await
    }

    async fn reset_for_retry(&self, id: &str) -> EngineResult<bool> {
        let id = id.to_string();
        self.execute(move |conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM recordings WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            match status.as_deref() {
                None => Err(EngineError::NotFound(id)),
                Some("synced") => Ok(false),
                Some(_) => {
                    conn.execute(
                        "UPDATE recordings
                         SET status = 'pending', synced_flag = 0, retry_count = 0,
                             last_retry_at = NULL, last_error = NULL
                         WHERE id = ?1",
                        params![id],
                    )?;
                    Ok(true)
                }
            }
        })
        .await
    }

    async fn requeue_interrupted(&self) -> EngineResult<usize> {
        self.execute(|conn| {
            Ok(conn.execute(
                "UPDATE recordings SET status = 'pending', synced_flag = 0 WHERE status = 'uploading'",
                [],
            )?)
        })
        .await
    }

    async fn delete_synced(&self) -> EngineResult<usize> {
        self.execute(|conn| Ok(conn.execute("DELETE FROM recordings WHERE synced_flag = 1", [])?))
            .await
    }

    async fn count_pending(&self) -> EngineResult<usize> {
        let max = self.max_retry_count;
        self.execute(move |conn| {
            let sql = format!(
                "SELECT COUNT(*) FROM recordings WHERE synced_flag = 0 AND {}",
                retryable_predicate()
            );
            let count: i64 = conn.query_row(&sql, params![max], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn stats(&self) -> EngineResult<CatalogStats> {
        let max = self.max_retry_count;
        self.execute(move |conn| {
            let mut stats = CatalogStats::default();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM recordings GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count = row.get::<_, i64>(1)? as usize;
                match status.parse::<RecordingStatus>().map_err(EngineError::PersistenceFailure)? {
                    RecordingStatus::Pending => stats.pending = count,
                    RecordingStatus::Uploading => stats.uploading = count,
                    RecordingStatus::Synced => stats.synced = count,
                    RecordingStatus::Failed => stats.failed = count,
                }
            }

            let dead: i64 = conn.query_row(
                "SELECT COUNT(*) FROM recordings WHERE status = 'failed' AND retry_count >= ?1",
                params![max],
                |row| row.get(0),
            )?;
            stats.dead_lettered = dead as usize;
            Ok(stats)
        })
        .await
    }

    fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }
}
