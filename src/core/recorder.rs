//! Recording session state machine.
//!
//! The [`Recorder`] owns at most one active session. While a session runs, a
//! spawned capture worker owns the fragment buffer, flushes it into the
//! chunk store on a fixed interval, and answers control commands (flush,
//! pause, resume, finish, abort) over a channel. Stopping assembles the
//! persisted chunks plus the remaining buffer into a catalog entry.
//!
//! ```text
//! Idle ──start──▶ Recording ◀──resume── Paused
//!  ▲                  │  └────pause──────▲
//!  │                stop/cancel
//!  └──── Stopping ◀───┘
//! Idle ──recover──▶ Recovering ──▶ Idle   (once at startup)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use fs2::FileExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::capture::{CaptureDevice, CaptureStream, Fragment};
use crate::config::CaptureSettings;
use crate::domain::{
    concat_chunks, destination_for, file_name_for, Chunk, NewRecording, SessionEvent, SessionState,
};
use crate::error::{EngineError, EngineResult};

use super::catalog::RecordingCatalog;
use super::chunk_store::ChunkStore;
use super::sync_queue::{SyncNotifier, SyncTrigger};

/// Recorder tuning
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// How often buffered fragments become a chunk
    pub flush_interval: Duration,

    /// strftime template for the destination folder path
    pub folder_template: String,

    /// Mime type assumed for recovered sessions
    pub default_mime_type: String,

    /// Advisory lock held while a session is active
    pub lock_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::from(&CaptureSettings::default())
    }
}

impl From<&CaptureSettings> for RecorderConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            flush_interval: settings.flush_interval,
            folder_template: settings.folder_template.clone(),
            default_mime_type: settings.mime_type.clone(),
            lock_path: None,
        }
    }
}

/// Point-in-time view of the active session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub elapsed: Duration,
    pub next_sequence: u32,
    pub captured_at: DateTime<Utc>,
}

/// Outcome of crash recovery
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Catalog ids created from orphaned sessions
    pub recovered: Vec<String>,

    /// Sessions with no chunks, removed
    pub discarded: usize,

    /// Sessions that already had a catalog entry; only their chunks were cleared
    pub already_finalized: usize,

    /// Sessions left on disk because recovery failed
    pub failed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.recovered.len() + self.discarded + self.already_finalized + self.failed
    }
}

/// Drives capture sessions and crash recovery
pub struct Recorder {
    chunks: Arc<dyn ChunkStore>,
    catalog: Arc<dyn RecordingCatalog>,
    device: Arc<dyn CaptureDevice>,
    config: RecorderConfig,

    /// Idle or Recovering while no session exists
    idle_state: SessionState,
    session: Option<ActiveSession>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    levels: Arc<watch::Sender<f32>>,
    notifier: Option<SyncNotifier>,
}

struct ActiveSession {
    id: Uuid,
    state: SessionState,
    started_at: Instant,
    captured_at: DateTime<Utc>,
    paused_total: Duration,
    pause_started_at: Option<Instant>,
    mime_type: String,
    next_sequence: Arc<AtomicU32>,
    worker: WorkerHandle,
    lock: Option<std::fs::File>,
}

impl ActiveSession {
    fn elapsed_at(&self, now: Instant) -> Duration {
        let mut paused = self.paused_total;
        if let Some(pause_started) = self.pause_started_at {
            paused += now.saturating_duration_since(pause_started);
        }
        now.saturating_duration_since(self.started_at)
            .saturating_sub(paused)
    }
}

impl Recorder {
    /// Create a recorder over injected stores and device
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        catalog: Arc<dyn RecordingCatalog>,
        device: Arc<dyn CaptureDevice>,
        config: RecorderConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (levels, _) = watch::channel(0.0);

        Self {
            chunks,
            catalog,
            device,
            config,
            idle_state: SessionState::Idle,
            session: None,
            events_tx,
            events_rx: Some(events_rx),
            levels: Arc::new(levels),
            notifier: None,
        }
    }

    /// Trigger a sync pass whenever a recording is cataloged
    pub fn with_sync_notifier(mut self, notifier: SyncNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Ordered, lossless session events (can be taken once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Latest input level; intermediate values may be skipped
    pub fn levels(&self) -> watch::Receiver<f32> {
        self.levels.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(self.idle_state)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Active time of the current session (zero when idle)
    pub fn elapsed(&self) -> Duration {
        self.session
            .as_ref()
            .map(|s| s.elapsed_at(Instant::now()))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.session.as_ref().map(|s| SessionSnapshot {
            session_id: s.id,
            state: s.state,
            elapsed: s.elapsed_at(Instant::now()),
            next_sequence: s.next_sequence.load(Ordering::SeqCst),
            captured_at: s.captured_at,
        })
    }

    fn emit(&self, event: SessionEvent) {
        // No subscriber is fine
        let _ = self.events_tx.send(event);
    }

    fn emit_state(&self, session_id: Option<Uuid>, state: SessionState) {
        self.emit(SessionEvent::StateChanged { session_id, state });
    }

    fn acquire_lock(&self) -> EngineResult<Option<std::fs::File>> {
        let Some(path) = &self.config.lock_path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            EngineError::SessionConflict(format!(
                "another process is recording (lock held on {})",
                path.display()
            ))
        })?;
        Ok(Some(file))
    }

    /// Begin a new capture session
    #[instrument(skip(self), fields(device = %self.device.name()))]
    pub async fn start(&mut self) -> EngineResult<Uuid> {
        if self.session.is_some() {
            return Err(EngineError::SessionConflict(
                "a recording session is already active".to_string(),
            ));
        }
        if self.idle_state == SessionState::Recovering {
            return Err(EngineError::SessionConflict(
                "crash recovery is in progress".to_string(),
            ));
        }

        let lock = self.acquire_lock()?;
        let stream = self.device.acquire().await?;

        let id = Uuid::new_v4();
        let mime_type = stream.mime_type().to_string();
        let next_sequence = Arc::new(AtomicU32::new(0));

        let worker = CaptureWorker {
            session_id: id,
            stream,
            stream_done: false,
            chunks: Arc::clone(&self.chunks),
            buffer: Vec::new(),
            unacked: Vec::new(),
            paused: false,
            next_sequence: Arc::clone(&next_sequence),
            events: self.events_tx.clone(),
            levels: Arc::clone(&self.levels),
        }
        .spawn(self.config.flush_interval);

        self.session = Some(ActiveSession {
            id,
            state: SessionState::Recording,
            started_at: Instant::now(),
            captured_at: Utc::now(),
            paused_total: Duration::ZERO,
            pause_started_at: None,
            mime_type,
            next_sequence,
            worker,
            lock,
        });

        info!(session_id = %id, "Recording started");
        self.emit_state(Some(id), SessionState::Recording);
        Ok(id)
    }

    /// Suspend capture and flush what has been buffered so far
    #[instrument(skip(self))]
    pub async fn pause(&mut self) -> EngineResult<()> {
        let session = self.active_in(SessionState::Recording, "pause")?;
        session.pause_started_at = Some(Instant::now());
        session.state = SessionState::Paused;
        let id = session.id;

        // A failed flush keeps the data buffered and is reported as an event
        if let Err(e) = session.worker.pause().await {
            warn!(session_id = %id, "Flush on pause failed: {}", e);
        }

        debug!(session_id = %id, "Recording paused");
        self.emit_state(Some(id), SessionState::Paused);
        Ok(())
    }

    /// Continue a paused session
    #[instrument(skip(self))]
    pub async fn resume(&mut self) -> EngineResult<()> {
        let session = self.active_in(SessionState::Paused, "resume")?;
        if let Some(pause_started) = session.pause_started_at.take() {
            session.paused_total += Instant::now().saturating_duration_since(pause_started);
        }
        session.state = SessionState::Recording;
        session.worker.resume().await;
        let id = session.id;

        debug!(session_id = %id, "Recording resumed");
        self.emit_state(Some(id), SessionState::Recording);
        Ok(())
    }

    /// Force an out-of-band flush; returns the sequence written, if any
    pub async fn flush(&mut self) -> EngineResult<Option<u32>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| EngineError::SessionConflict("no active session to flush".to_string()))?;
        session.worker.flush().await
    }

    fn active_in(&mut self, expected: SessionState, action: &str) -> EngineResult<&mut ActiveSession> {
        match self.session.as_mut() {
            Some(session) if session.state == expected => Ok(session),
            Some(session) => Err(EngineError::SessionConflict(format!(
                "cannot {} while {:?}",
                action, session.state
            ))),
            None => Err(EngineError::SessionConflict(format!(
                "no active session to {}",
                action
            ))),
        }
    }

    /// Finalize the session into a `pending` catalog entry.
    ///
    /// Returns the catalog id, or `None` when nothing was captured.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> EngineResult<Option<String>> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| EngineError::SessionConflict("no active session to stop".to_string()))?;

        let duration = session.elapsed_at(Instant::now());
        session.state = SessionState::Stopping;
        self.emit_state(Some(session.id), SessionState::Stopping);

        let result = self.finalize(&mut session, duration).await;
        release_lock(session.lock.take());

        self.emit_state(None, SessionState::Idle);
        match &result {
            Ok(Some(id)) => info!(session_id = %session.id, recording_id = %id, "Recording finalized"),
            Ok(None) => info!(session_id = %session.id, "Recording was empty, discarded"),
            Err(e) => error!(session_id = %session.id, "Finalization failed: {}", e),
        }
        result
    }

    async fn finalize(
        &mut self,
        session: &mut ActiveSession,
        duration: Duration,
    ) -> EngineResult<Option<String>> {
        let tail = session.worker.finish().await;
        let persisted = self.chunks.list_by_session(session.id).await?;

        let mut payload = concat_chunks(&persisted);
        payload.extend_from_slice(&tail);

        if payload.is_empty() {
            self.chunks.clear_session(session.id).await?;
            return Ok(None);
        }

        let local_start = session.captured_at.with_timezone(&Local);
        let recording = NewRecording {
            session_id: session.id,
            payload,
            captured_at: session.captured_at,
            duration_seconds: duration.as_secs_f64().round() as u64,
            destination_path: destination_for(&local_start, &self.config.folder_template),
            file_name: file_name_for(&local_start, &session.mime_type, false),
            mime_type: session.mime_type.clone(),
            recovered: false,
        };

        let id = match self.catalog.insert(recording).await {
            Ok(id) => id,
            Err(e) => {
                // Leave everything in the chunk log for the next recovery
                if !tail.is_empty() {
                    let next = session.next_sequence.load(Ordering::SeqCst);
                    if let Err(persist_err) = self.chunks.append(session.id, next, &tail).await {
                        error!(session_id = %session.id, "Could not persist tail after catalog failure: {}", persist_err);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = self.chunks.clear_session(session.id).await {
            // Recovery clears it later without duplicating the entry
            warn!(session_id = %session.id, "Failed to clear chunks after finalize: {}", e);
        }

        self.emit(SessionEvent::Finalized {
            session_id: session.id,
            recording_id: id.clone(),
            recovered: false,
        });
        if let Some(notifier) = &self.notifier {
            notifier.notify(SyncTrigger::NewRecording);
        }
        Ok(Some(id))
    }

    /// Discard the session without creating a catalog entry
    #[instrument(skip(self))]
    pub async fn cancel(&mut self) -> EngineResult<()> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| EngineError::SessionConflict("no active session to cancel".to_string()))?;

        session.worker.abort().await;
        let cleared = self.chunks.clear_session(session.id).await;
        release_lock(session.lock.take());

        info!(session_id = %session.id, "Recording cancelled");
        self.emit_state(None, SessionState::Idle);
        cleared
    }

    /// Turn sessions orphaned by a crash into recovered catalog entries.
    ///
    /// Run once before normal operation. Per-session failures are logged and
    /// leave that session's chunks in place for the next attempt.
    #[instrument(skip(self))]
    pub async fn recover(&mut self) -> EngineResult<RecoveryReport> {
        if self.session.is_some() {
            return Err(EngineError::SessionConflict(
                "cannot recover while a session is active".to_string(),
            ));
        }

        // A session recording in another process is not an orphan
        let lock = self.acquire_lock()?;

        self.idle_state = SessionState::Recovering;
        self.emit_state(None, SessionState::Recovering);

        let result = self.recover_orphans().await;
        release_lock(lock);

        self.idle_state = SessionState::Idle;
        self.emit_state(None, SessionState::Idle);

        if let Ok(report) = &result {
            if report.total() > 0 {
                info!(
                    recovered = report.recovered.len(),
                    discarded = report.discarded,
                    already_finalized = report.already_finalized,
                    failed = report.failed,
                    "Crash recovery finished"
                );
            }
        }
        result
    }

    async fn recover_orphans(&mut self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for session_id in self.chunks.list_orphan_sessions().await? {
            match self.recover_session(session_id).await {
                Ok(Recovered::Created(id)) => {
                    self.emit(SessionEvent::Finalized {
                        session_id,
                        recording_id: id.clone(),
                        recovered: true,
                    });
                    report.recovered.push(id);
                }
                Ok(Recovered::Empty) => report.discarded += 1,
                Ok(Recovered::AlreadyFinalized) => report.already_finalized += 1,
                Err(e) => {
                    warn!(%session_id, "Failed to recover session: {}", e);
                    self.emit(SessionEvent::Error {
                        session_id: Some(session_id),
                        message: e.to_string(),
                    });
                    report.failed += 1;
                }
            }
        }

        if !report.recovered.is_empty() {
            if let Some(notifier) = &self.notifier {
                notifier.notify(SyncTrigger::NewRecording);
            }
        }
        Ok(report)
    }

    async fn recover_session(&self, session_id: Uuid) -> EngineResult<Recovered> {
        let chunks = self.chunks.list_by_session(session_id).await?;

        if chunks.is_empty() {
            self.chunks.clear_session(session_id).await?;
            return Ok(Recovered::Empty);
        }

        if self.catalog.find_by_session(session_id).await?.is_some() {
            self.chunks.clear_session(session_id).await?;
            return Ok(Recovered::AlreadyFinalized);
        }

        let recording = self.recovered_recording(session_id, &chunks);
        let id = self.catalog.insert(recording).await?;
        self.chunks.clear_session(session_id).await?;

        info!(%session_id, recording_id = %id, chunks = chunks.len(), "Recovered orphaned session");
        Ok(Recovered::Created(id))
    }

    fn recovered_recording(&self, session_id: Uuid, chunks: &[Chunk]) -> NewRecording {
        let interval = chrono::Duration::from_std(self.config.flush_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let first = chunks.iter().map(|c| c.captured_at).min().unwrap_or_else(Utc::now);
        let last = chunks.iter().map(|c| c.captured_at).max().unwrap_or(first);

        // The first chunk lands one interval after capture began
        let started = first - interval;
        let duration = (last - first + interval).num_seconds().max(0) as u64;

        let local_start = started.with_timezone(&Local);
        let mime_type = self.config.default_mime_type.clone();

        NewRecording {
            session_id,
            payload: concat_chunks(chunks),
            captured_at: started,
            duration_seconds: duration,
            destination_path: destination_for(&local_start, &self.config.folder_template),
            file_name: file_name_for(&local_start, &mime_type, true),
            mime_type,
            recovered: true,
        }
    }
}

enum Recovered {
    Created(String),
    Empty,
    AlreadyFinalized,
}

fn release_lock(lock: Option<std::fs::File>) {
    if let Some(file) = lock {
        if let Err(e) = FileExt::unlock(&file) {
            warn!("Failed to release recorder lock: {}", e);
        }
    }
}

// ============================================================================
// Capture worker
// ============================================================================

enum WorkerCommand {
    Flush(oneshot::Sender<EngineResult<Option<u32>>>),
    Pause(oneshot::Sender<EngineResult<Option<u32>>>),
    Resume,
    Finish(oneshot::Sender<Vec<u8>>),
    Abort(oneshot::Sender<()>),
}

struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    async fn flush(&self) -> EngineResult<Option<u32>> {
        self.request(WorkerCommand::Flush)
            .await
            .unwrap_or_else(|| Err(worker_gone()))
    }

    async fn pause(&self) -> EngineResult<Option<u32>> {
        self.request(WorkerCommand::Pause)
            .await
            .unwrap_or_else(|| Err(worker_gone()))
    }

    async fn resume(&self) {
        let _ = self.commands.send(WorkerCommand::Resume).await;
    }

    /// Stop the worker and take whatever was not persisted
    async fn finish(&mut self) -> Vec<u8> {
        let tail = self.request(WorkerCommand::Finish).await.unwrap_or_default();
        self.join().await;
        tail
    }

    async fn abort(&mut self) {
        let _ = self.request(WorkerCommand::Abort).await;
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Capture worker panicked: {}", e);
            }
        }
    }
}

fn worker_gone() -> EngineError {
    EngineError::PersistenceFailure("capture worker is not running".to_string())
}

struct CaptureWorker {
    session_id: Uuid,
    stream: CaptureStream,
    stream_done: bool,
    chunks: Arc<dyn ChunkStore>,

    /// Fragments not yet handed to the chunk store
    buffer: Vec<u8>,

    /// Payload of a failed append, retried under the same sequence
    unacked: Vec<u8>,

    paused: bool,
    next_sequence: Arc<AtomicU32>,
    events: mpsc::UnboundedSender<SessionEvent>,
    levels: Arc<watch::Sender<f32>>,
}

impl CaptureWorker {
    fn spawn(self, flush_interval: Duration) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(self.run(rx, flush_interval));
        WorkerHandle {
            commands: tx,
            task: Some(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>, flush_interval: Duration) {
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(WorkerCommand::Flush(reply)) => {
                        self.drain_ready();
                        let _ = reply.send(self.flush().await);
                    }
                    Some(WorkerCommand::Pause(reply)) => {
                        self.drain_ready();
                        self.paused = true;
                        let _ = reply.send(self.flush().await);
                    }
                    Some(WorkerCommand::Resume) => self.paused = false,
                    Some(WorkerCommand::Finish(reply)) => {
                        self.drain_ready();
                        let mut tail = std::mem::take(&mut self.unacked);
                        tail.append(&mut self.buffer);
                        let _ = reply.send(tail);
                        break;
                    }
                    Some(WorkerCommand::Abort(reply)) => {
                        self.buffer.clear();
                        self.unacked.clear();
                        let _ = reply.send(());
                        break;
                    }
                    // Recorder dropped mid-session; chunks stay for recovery
                    None => break,
                },

                _ = ticker.tick() => {
                    self.drain_ready();
                    let _ = self.flush().await;
                }

                fragment = self.stream.next_fragment(), if !self.stream_done => match fragment {
                    Some(fragment) => self.accept(fragment),
                    None => {
                        debug!(session_id = %self.session_id, "Capture stream ended");
                        self.stream_done = true;
                        let _ = self.events.send(SessionEvent::InputEnded {
                            session_id: self.session_id,
                        });
                    }
                },
            }
        }
    }

    fn accept(&mut self, fragment: Fragment) {
        if self.paused {
            return;
        }
        self.levels.send_replace(fragment.level);
        self.buffer.extend_from_slice(&fragment.data);
    }

    /// Take fragments that already arrived; commands are polled first
    fn drain_ready(&mut self) {
        while !self.stream_done {
            match self.stream.try_next_fragment() {
                Some(fragment) => self.accept(fragment),
                None => break,
            }
        }
    }

    async fn flush(&mut self) -> EngineResult<Option<u32>> {
        if self.unacked.is_empty() {
            if self.buffer.is_empty() {
                return Ok(None);
            }
            self.unacked = std::mem::take(&mut self.buffer);
        }

        let sequence = self.next_sequence.load(Ordering::SeqCst);
        match self.chunks.append(self.session_id, sequence, &self.unacked).await {
            Ok(_) => {
                let size_bytes = self.unacked.len() as u64;
                self.unacked.clear();
                self.next_sequence.store(sequence + 1, Ordering::SeqCst);

                debug!(session_id = %self.session_id, sequence, size_bytes, "Chunk flushed");
                let _ = self.events.send(SessionEvent::ChunkSaved {
                    session_id: self.session_id,
                    sequence,
                    size_bytes,
                });
                Ok(Some(sequence))
            }
            Err(e) => {
                warn!(session_id = %self.session_id, sequence, "Chunk flush failed, keeping data buffered: {}", e);
                let _ = self.events.send(SessionEvent::Error {
                    session_id: Some(self.session_id),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChannelDevice;
    use crate::core::catalog::SqliteCatalog;
    use crate::core::chunk_store::MemoryChunkStore;
    use crate::domain::RecordingStatus;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    struct Harness {
        recorder: Recorder,
        fragments: mpsc::Sender<Fragment>,
        chunks: Arc<MemoryChunkStore>,
        catalog: SqliteCatalog,
    }

    fn harness() -> Harness {
        let chunks = Arc::new(MemoryChunkStore::new());
        harness_with(chunks.clone(), chunks)
    }

    fn harness_with(chunks: Arc<MemoryChunkStore>, store: Arc<dyn ChunkStore>) -> Harness {
        let (device, fragments) = ChannelDevice::new("test", "audio/webm", 16);
        let catalog = SqliteCatalog::open_in_memory(5).unwrap();
        let recorder = Recorder::new(
            store,
            Arc::new(catalog.clone()),
            Arc::new(device),
            RecorderConfig::default(),
        );
        Harness {
            recorder,
            fragments,
            chunks,
            catalog,
        }
    }

    async fn send(tx: &mpsc::Sender<Fragment>, data: &[u8]) {
        tx.send(Fragment::new(data.to_vec())).await.unwrap();
    }

    /// Store whose next `fail_next` appends fail
    struct FlakyStore {
        inner: Arc<MemoryChunkStore>,
        fail_next: AtomicUsize,
    }

    #[async_trait]
    impl ChunkStore for FlakyStore {
        async fn append(&self, session_id: Uuid, sequence: u32, payload: &[u8]) -> EngineResult<String> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::PersistenceFailure("disk full".to_string()));
            }
            self.inner.append(session_id, sequence, payload).await
        }

        async fn list_by_session(&self, session_id: Uuid) -> EngineResult<Vec<Chunk>> {
            self.inner.list_by_session(session_id).await
        }

        async fn clear_session(&self, session_id: Uuid) -> EngineResult<()> {
            self.inner.clear_session(session_id).await
        }

        async fn list_orphan_sessions(&self) -> EngineResult<BTreeSet<Uuid>> {
            self.inner.list_orphan_sessions().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_excludes_paused_time() {
        let mut h = harness();
        h.recorder.start().await.unwrap();
        send(&h.fragments, b"voice").await;

        sleep(Duration::from_secs(10)).await;
        h.recorder.pause().await.unwrap();
        assert_eq!(h.recorder.state(), SessionState::Paused);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.recorder.elapsed(), Duration::from_secs(10));
        h.recorder.resume().await.unwrap();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.recorder.elapsed(), Duration::from_secs(15));

        let id = h.recorder.stop().await.unwrap().unwrap();
        let recording = h.catalog.get(&id).await.unwrap().unwrap();
        assert_eq!(recording.duration_seconds, 15);
        assert_eq!(h.recorder.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_paused_drops_paused_input() {
        let mut h = harness();
        h.recorder.start().await.unwrap();
        send(&h.fragments, b"kept").await;

        sleep(Duration::from_secs(8)).await;
        h.recorder.pause().await.unwrap();
        send(&h.fragments, b"dropped").await;
        sleep(Duration::from_secs(20)).await;

        assert_eq!(h.recorder.state(), SessionState::Paused);
        let id = h.recorder.stop().await.unwrap().unwrap();

        let recording = h.catalog.get(&id).await.unwrap().unwrap();
        assert_eq!(recording.duration_seconds, 8);
        assert_eq!(h.catalog.payload(&id).await.unwrap(), b"kept");
        assert_eq!(h.recorder.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_then_finalize() {
        let mut h = harness();
        let mut events = h.recorder.take_events().unwrap();
        let session_id = h.recorder.start().await.unwrap();

        send(&h.fragments, b"aa").await;
        sleep(Duration::from_secs(31)).await;
        send(&h.fragments, b"bb").await;
        sleep(Duration::from_secs(34)).await;
        send(&h.fragments, b"cc").await;

        let persisted = h.chunks.list_by_session(session_id).await.unwrap();
        let sequences: Vec<u32> = persisted.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);

        let id = h.recorder.stop().await.unwrap().unwrap();

        assert!(h.chunks.list_by_session(session_id).await.unwrap().is_empty());
        let recording = h.catalog.get(&id).await.unwrap().unwrap();
        assert_eq!(recording.status, RecordingStatus::Pending);
        assert_eq!(recording.session_id, session_id);
        assert_eq!(recording.duration_seconds, 65);
        assert!(!recording.recovered);
        assert_eq!(h.catalog.payload(&id).await.unwrap(), b"aabbcc");
        assert_eq!(h.catalog.count_pending().await.unwrap(), 1);

        let mut saved = Vec::new();
        let mut finalized = None;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::ChunkSaved { sequence, .. } => saved.push(sequence),
                SessionEvent::Finalized { recording_id, .. } => finalized = Some(recording_id),
                _ => {}
            }
        }
        assert_eq!(saved, vec![0, 1]);
        assert_eq!(finalized, Some(id));
    }

    #[tokio::test]
    async fn test_state_conflicts() {
        let mut h = harness();

        assert!(matches!(h.recorder.pause().await, Err(EngineError::SessionConflict(_))));
        assert!(matches!(h.recorder.stop().await, Err(EngineError::SessionConflict(_))));

        h.recorder.start().await.unwrap();
        assert!(matches!(h.recorder.start().await, Err(EngineError::SessionConflict(_))));
        assert!(matches!(h.recorder.resume().await, Err(EngineError::SessionConflict(_))));

        h.recorder.pause().await.unwrap();
        assert!(matches!(h.recorder.pause().await, Err(EngineError::SessionConflict(_))));
        assert!(matches!(h.recorder.recover().await, Err(EngineError::SessionConflict(_))));
    }

    #[tokio::test]
    async fn test_empty_session_creates_no_entry() {
        let mut h = harness();
        h.recorder.start().await.unwrap();

        assert_eq!(h.recorder.stop().await.unwrap(), None);
        assert!(h.catalog.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_discards_everything() {
        let mut h = harness();
        let session_id = h.recorder.start().await.unwrap();
        send(&h.fragments, b"secret").await;
        h.recorder.flush().await.unwrap();
        assert_eq!(h.chunks.list_by_session(session_id).await.unwrap().len(), 1);

        h.recorder.cancel().await.unwrap();

        assert_eq!(h.recorder.state(), SessionState::Idle);
        assert!(h.chunks.list_by_session(session_id).await.unwrap().is_empty());
        assert!(h.catalog.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_sequence_and_data() {
        let chunks = Arc::new(MemoryChunkStore::new());
        let store = Arc::new(FlakyStore {
            inner: chunks.clone(),
            fail_next: AtomicUsize::new(1),
        });
        let mut h = harness_with(chunks, store);
        let mut events = h.recorder.take_events().unwrap();
        let session_id = h.recorder.start().await.unwrap();

        send(&h.fragments, b"first").await;
        // The failed flush is reported, the pause still happens
        h.recorder.pause().await.unwrap();
        assert_eq!(h.recorder.state(), SessionState::Paused);
        assert_eq!(h.recorder.snapshot().unwrap().next_sequence, 0);

        h.recorder.resume().await.unwrap();
        send(&h.fragments, b"second").await;
        assert_eq!(h.recorder.flush().await.unwrap(), Some(0));
        assert_eq!(h.recorder.flush().await.unwrap(), Some(1));

        let persisted = h.chunks.list_by_session(session_id).await.unwrap();
        assert_eq!(persisted[0].payload, b"first");
        assert_eq!(persisted[1].payload, b"second");

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Error { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_recover_orphaned_chunks() {
        let mut h = harness();
        let orphan = Uuid::new_v4();
        h.chunks.append(orphan, 0, b"He").await.unwrap();
        h.chunks.append(orphan, 1, b"llo").await.unwrap();

        let report = h.recorder.recover().await.unwrap();

        assert_eq!(report.recovered.len(), 1);
        let recording = h.catalog.get(&report.recovered[0]).await.unwrap().unwrap();
        assert_eq!(recording.status, RecordingStatus::Pending);
        assert_eq!(recording.session_id, orphan);
        assert!(recording.recovered);
        assert!(recording.file_name.contains("_recovered"));
        assert_eq!(h.catalog.payload(&recording.id).await.unwrap(), b"Hello");
        assert!(h.chunks.list_by_session(orphan).await.unwrap().is_empty());
        assert_eq!(h.recorder.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let mut h = harness();
        let orphan = Uuid::new_v4();
        h.chunks.append(orphan, 0, b"data").await.unwrap();
        let first = h.recorder.recover().await.unwrap();
        assert_eq!(first.recovered.len(), 1);

        // Crash between catalog insert and chunk cleanup
        h.chunks.append(orphan, 0, b"data").await.unwrap();
        let second = h.recorder.recover().await.unwrap();

        assert!(second.recovered.is_empty());
        assert_eq!(second.already_finalized, 1);
        assert_eq!(h.catalog.list_all().await.unwrap().len(), 1);
        assert!(h.chunks.list_orphan_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_blocks_second_recorder() {
        let temp = tempfile::TempDir::new().unwrap();
        let lock_path = temp.path().join("recorder.lock");
        let config = RecorderConfig {
            lock_path: Some(lock_path),
            ..RecorderConfig::default()
        };

        let build = |config: RecorderConfig| {
            let (device, _tx) = ChannelDevice::new("test", "audio/webm", 4);
            Recorder::new(
                Arc::new(MemoryChunkStore::new()),
                Arc::new(SqliteCatalog::open_in_memory(5).unwrap()),
                Arc::new(device),
                config,
            )
        };

        let mut first = build(config.clone());
        let mut second = build(config);

        first.start().await.unwrap();
        assert!(matches!(second.start().await, Err(EngineError::SessionConflict(_))));

        first.cancel().await.unwrap();
        second.start().await.unwrap();
    }
}
