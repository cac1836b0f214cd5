//! Upload queue draining the catalog into the remote store.
//!
//! A pass walks the pending and retryable entries oldest first, strictly one
//! at a time. Failures are recorded on the entry and never abort the pass.
//! Passes are single-flight: a pass requested while another runs returns
//! [`PassOutcome::Skipped`] immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Connectivity, RemoteUploader};
use crate::config::SyncSettings;
use crate::domain::{Recording, RecordingStatus, StatusUpdate};
use crate::error::{EngineError, EngineResult};

use super::catalog::RecordingCatalog;
use super::retry::BackoffPolicy;

/// Why a pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Timer,
    Reconnect,
    NewRecording,
    Manual,
}

/// Cloneable handle for requesting sync passes
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl SyncNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncTrigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request a pass; ignored once the queue is gone
    pub fn notify(&self, trigger: SyncTrigger) {
        let _ = self.tx.send(trigger);
    }
}

/// Coarse sync state for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncIndicator {
    Idle { pending: usize },
    Syncing,
    Synced,
    Offline,
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    Unauthenticated,
}

/// Result of a single pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    Completed { synced: usize, failed: usize },
}

/// Sync queue tuning
#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    pub interval: Duration,
    pub upload_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncQueueConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            interval: settings.interval,
            upload_timeout: settings.upload_timeout,
            backoff: BackoffPolicy::from(settings),
        }
    }
}

/// Clears the single-flight flag when a pass ends, however it ends
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains pending recordings into a [`RemoteUploader`]
pub struct SyncQueue {
    catalog: Arc<dyn RecordingCatalog>,
    uploader: Arc<dyn RemoteUploader>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncQueueConfig,

    syncing: AtomicBool,
    requeued: AtomicBool,
    indicator: watch::Sender<SyncIndicator>,
    notifier: SyncNotifier,
    triggers: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
}

impl SyncQueue {
    pub fn new(
        catalog: Arc<dyn RecordingCatalog>,
        uploader: Arc<dyn RemoteUploader>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncQueueConfig,
    ) -> Self {
        let (notifier, triggers) = SyncNotifier::channel();
        let (indicator, _) = watch::channel(SyncIndicator::Idle { pending: 0 });

        Self {
            catalog,
            uploader,
            connectivity,
            config,
            syncing: AtomicBool::new(false),
            requeued: AtomicBool::new(false),
            indicator,
            notifier,
            triggers: Mutex::new(Some(triggers)),
        }
    }

    /// Handle for the recorder and connectivity monitors
    pub fn notifier(&self) -> SyncNotifier {
        self.notifier.clone()
    }

    pub fn indicator(&self) -> watch::Receiver<SyncIndicator> {
        self.indicator.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Drive passes from the timer and triggers until `stop` fires.
    ///
    /// A pass in progress always completes before the loop exits.
    pub async fn run(&self, mut stop: mpsc::Receiver<()>) -> EngineResult<()> {
        let mut triggers = {
            let mut slot = match self.triggers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take().ok_or_else(|| {
                EngineError::SessionConflict("sync loop is already running".to_string())
            })?
        };

        self.requeue_interrupted().await?;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.config.interval.as_secs(), uploader = %self.uploader.name(), "Sync loop started");

        loop {
            let trigger = tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => SyncTrigger::Timer,
                Some(trigger) = triggers.recv() => trigger,
            };

            debug!(?trigger, "Sync pass requested");
            match self.sync_now().await {
                Ok(PassOutcome::Completed { synced, failed }) if synced + failed > 0 => {
                    info!(synced, failed, "Sync pass finished");
                }
                Ok(outcome) => debug!(?outcome, "Sync pass finished"),
                Err(e) => warn!("Sync pass aborted: {}", e),
            }
        }

        // Hand the receiver back so the loop can be restarted
        let mut slot = match self.triggers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(triggers);

        info!("Sync loop stopped");
        Ok(())
    }

    /// Put uploads left `uploading` by a previous process back to `pending`.
    ///
    /// Runs at most once per queue, before its first pass; later calls
    /// return 0 so uploads of this process are never touched.
    pub async fn requeue_interrupted(&self) -> EngineResult<usize> {
        if self.requeued.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        match self.catalog.requeue_interrupted().await {
            Ok(requeued) => {
                if requeued > 0 {
                    info!(requeued, "Requeued uploads interrupted by a previous run");
                }
                Ok(requeued)
            }
            Err(e) => {
                self.requeued.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Run one pass now (no-op if one is already running)
    #[instrument(skip(self))]
    pub async fn sync_now(&self) -> EngineResult<PassOutcome> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync pass already running, skipping");
            return Ok(PassOutcome::Skipped(SkipReason::AlreadySyncing));
        }
        let _guard = SyncingGuard(&self.syncing);

        self.requeue_interrupted().await?;

        if !self.connectivity.is_online().await {
            self.indicator.send_replace(SyncIndicator::Offline);
            return Ok(PassOutcome::Skipped(SkipReason::Offline));
        }
        if !self.uploader.is_authenticated().await {
            self.indicator.send_replace(SyncIndicator::Unauthenticated);
            return Ok(PassOutcome::Skipped(SkipReason::Unauthenticated));
        }

        let now = Utc::now();
        let due: Vec<Recording> = self
            .catalog
            .list_pending_or_retryable()
            .await?
            .into_iter()
            .filter(|recording| self.config.backoff.is_due(recording, now))
            .collect();

        if due.is_empty() {
            self.publish_pending().await;
            return Ok(PassOutcome::Completed { synced: 0, failed: 0 });
        }

        self.indicator.send_replace(SyncIndicator::Syncing);

        let mut synced = 0;
        let mut failed = 0;
        for recording in &due {
            match self.sync_one(recording).await {
                Ok(remote_id) => {
                    info!(id = %recording.id, remote_id = %remote_id, "Recording synced");
                    synced += 1;
                }
                Err(e) => {
                    self.record_failure(recording, &e).await;
                    failed += 1;
                }
            }
        }

        self.publish_pending().await;
        Ok(PassOutcome::Completed { synced, failed })
    }

    async fn sync_one(&self, recording: &Recording) -> EngineResult<String> {
        let id = recording.id.as_str();
        self.catalog
            .update_status(id, RecordingStatus::Uploading, StatusUpdate::default())
            .await?;

        let remote_id = match self.attempt(recording).await {
            Err(e) if e.is_auth_expired() => {
                debug!(id = %id, "Token rejected, re-authenticating once");
                self.uploader.authenticate().await?;
                self.attempt(recording).await?
            }
            other => other?,
        };

        self.catalog
            .update_status(id, RecordingStatus::Synced, StatusUpdate::synced(remote_id.clone()))
            .await?;
        Ok(remote_id)
    }

    /// Folder resolution plus upload, bounded by the upload timeout
    async fn attempt(&self, recording: &Recording) -> EngineResult<String> {
        let payload = self.catalog.payload(&recording.id).await?;

        let upload = async {
            let folder_id = self.uploader.ensure_folder(&recording.destination_path).await?;
            self.uploader
                .upload(payload, &recording.file_name, &recording.mime_type, &folder_id)
                .await
        };

        match tokio::time::timeout(self.config.upload_timeout, upload).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::transient(format!(
                "upload timed out after {}s",
                self.config.upload_timeout.as_secs()
            ))),
        }
    }

    async fn record_failure(&self, recording: &Recording, err: &EngineError) {
        let id = recording.id.as_str();
        warn!(id = %id, file = %recording.file_name, "Upload failed: {}", err);

        if let Err(e) = self
            .catalog
            .update_status(id, RecordingStatus::Failed, StatusUpdate::failed(err.to_string()))
            .await
        {
            error!(id = %id, "Could not mark recording failed: {}", e);
            return;
        }

        match self.catalog.increment_retry(id).await {
            Ok(count) if count >= self.catalog.max_retry_count() => {
                warn!(id = %id, retry_count = count, "Retry budget exhausted, recording dead-lettered");
            }
            Ok(_) => {}
            Err(e) => error!(id = %id, "Could not record retry: {}", e),
        }
    }

    async fn publish_pending(&self) {
        match self.catalog.count_pending().await {
            Ok(0) => {
                self.indicator.send_replace(SyncIndicator::Synced);
            }
            Ok(pending) => {
                self.indicator.send_replace(SyncIndicator::Idle { pending });
            }
            Err(e) => warn!("Could not count pending recordings: {}", e),
        }
    }
}
