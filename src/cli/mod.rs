//! Command-line interface for voxsync.
//!
//! Provides commands for recording, crash recovery, inspecting the catalog,
//! and syncing recordings to the configured remote.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{
    Connectivity, DirectoryUploader, DriveUploader, RemoteUploader, TcpProbe,
};
use crate::config::{self, RemoteKind, ResolvedConfig};
use crate::core::{
    ChunkStore, FileChunkStore, PassOutcome, RecordingCatalog, SkipReason, SqliteCatalog, SyncIndicator,
    SyncQueue, SyncQueueConfig,
};
use crate::domain::RecordingStatus;
use crate::settings::{JsonSettings, Settings, CAPTURE_DEVICE, SETUP_COMPLETE};

pub mod record;

/// Timeout for the connectivity probe before each pass
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// voxsync - crash-safe voice capture with background sync
#[derive(Parser, Debug)]
#[command(name = "voxsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record from a capture device until Ctrl+C (or the input ends)
    Record {
        /// Raw audio source: a file, FIFO, or "-" for stdin (defaults to the configured device)
        #[arg(short, long)]
        input: Option<String>,

        /// Stop automatically after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Turn sessions interrupted by a crash into recordings
    Recover,

    /// List recordings in the catalog
    List {
        /// Filter by status (pending, uploading, synced, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of recordings to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show catalog and sync status
    Status,

    /// Upload pending recordings
    Sync {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Give failed recordings a fresh retry budget
    Retry {
        /// Recording ID
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Retry every failed recording
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Delete recordings that are already synced
    Purge,

    /// First-run setup
    Setup {
        /// Capture device path (or "-" for stdin)
        #[arg(short, long)]
        device: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Record { input, duration } => {
                record::execute_record(input, duration.map(Duration::from_secs)).await
            }
            Commands::Recover => record::execute_recover().await,
            Commands::List { status, limit } => list_recordings(status, limit).await,
            Commands::Status => show_status().await,
            Commands::Sync { once } => sync(once).await,
            Commands::Retry { id, all } => retry(id, all).await,
            Commands::Purge => purge().await,
            Commands::Setup { device } => setup(&device),
            Commands::Config => show_config(),
        }
    }
}

/// Open the chunk store under the configured home
pub(crate) fn open_chunks(cfg: &ResolvedConfig) -> FileChunkStore {
    FileChunkStore::new(config::paths::chunks_dir_in(&cfg.home))
}

/// Open the catalog under the configured home
pub(crate) fn open_catalog(cfg: &ResolvedConfig) -> Result<SqliteCatalog> {
    let path = config::paths::catalog_db_in(&cfg.home);
    SqliteCatalog::open(&path, cfg.sync.max_retry_count)
        .with_context(|| format!("Failed to open catalog: {}", path.display()))
}

/// Build the uploader selected by `remote.kind`
fn build_uploader(cfg: &ResolvedConfig) -> Result<Arc<dyn RemoteUploader>> {
    let remote = &cfg.remote;
    let uploader: Arc<dyn RemoteUploader> = match remote.kind {
        RemoteKind::Drive => Arc::new(DriveUploader::from_settings(remote)),
        RemoteKind::Directory => {
            let target = remote
                .directory
                .clone()
                .context("remote.directory is not configured")?;
            Arc::new(DirectoryUploader::new(target, remote.root_folder.clone()))
        }
    };
    Ok(uploader)
}

/// Connectivity check matching the remote kind
fn build_connectivity(cfg: &ResolvedConfig) -> Arc<dyn Connectivity> {
    match cfg.remote.kind {
        RemoteKind::Drive => Arc::new(TcpProbe::new(cfg.remote.probe_host.clone(), PROBE_TIMEOUT)),
        RemoteKind::Directory => Arc::new(crate::adapters::ManualConnectivity::new(true)),
    }
}

/// List recordings, newest first
async fn list_recordings(status_filter: Option<String>, limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let catalog = open_catalog(cfg)?;

    let status = status_filter
        .as_deref()
        .map(str::parse::<RecordingStatus>)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let recordings: Vec<_> = catalog
        .list_all()
        .await?
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();

    if recordings.is_empty() {
        println!("No recordings");
        if let Some(status) = status {
            println!("  (filtered by status: {})", status);
        }
        return Ok(());
    }

    println!();
    println!(
        "{:<14} {:<10} {:>8} {:>6}  {:<42} {:<20}",
        "ID", "STATUS", "DURATION", "TRIES", "DESTINATION", "CAPTURED"
    );
    println!("{}", "-".repeat(106));

    for recording in recordings.iter().take(limit) {
        let status = if recording.is_dead_lettered(catalog.max_retry_count()) {
            "dead".to_string()
        } else {
            recording.status.to_string()
        };
        let captured = recording
            .captured_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S");

        println!(
            "{:<14} {:<10} {:>7}s {:>6}  {:<42} {:<20}",
            short_id(&recording.id),
            status,
            recording.duration_seconds,
            recording.retry_count,
            format!("{}/{}", recording.destination_display(), recording.file_name),
            captured
        );
    }

    if recordings.len() > limit {
        println!();
        println!("... and {} more (use --limit to show more)", recordings.len() - limit);
    }

    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Show catalog counts and recent failures
async fn show_status() -> Result<()> {
    let cfg = config::config()?;
    let catalog = open_catalog(cfg)?;
    let stats = catalog.stats().await?;
    let orphans = open_chunks(cfg).list_orphan_sessions().await?.len();

    println!();
    println!("voxsync status");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Home:    {}", cfg.home.display());
    println!("Remote:  {:?} ({})", cfg.remote.kind, cfg.remote.root_folder);
    println!();
    println!("Recordings:");
    println!("  Pending:       {}", stats.pending);
    println!("  Uploading:     {}", stats.uploading);
    println!("  Synced:        {}", stats.synced);
    println!("  Failed:        {}", stats.failed);
    println!("  Dead-lettered: {}", stats.dead_lettered);
    println!("  Total:         {}", stats.total());

    if orphans > 0 {
        println!();
        println!("{} interrupted session(s) on disk, run `voxsync recover`", orphans);
    }

    let failures: Vec<_> = catalog
        .list_all()
        .await?
        .into_iter()
        .filter(|r| r.status == RecordingStatus::Failed)
        .take(5)
        .collect();
    if !failures.is_empty() {
        println!();
        println!("Recent failures:");
        for recording in failures {
            println!(
                "  {} ({} tries): {}",
                short_id(&recording.id),
                recording.retry_count,
                recording.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!();

    Ok(())
}

/// Upload pending recordings, once or continuously
async fn sync(once: bool) -> Result<()> {
    let cfg = config::config()?;

    // Orphaned sessions become uploadable recordings first
    record::recover_with(cfg).await?;

    let catalog: Arc<dyn RecordingCatalog> = Arc::new(open_catalog(cfg)?);
    let queue = Arc::new(SyncQueue::new(
        catalog,
        build_uploader(cfg)?,
        build_connectivity(cfg),
        SyncQueueConfig::from(&cfg.sync),
    ));

    if once {
        let outcome = queue.sync_now().await.context("Sync pass failed")?;
        print_outcome(&outcome);
        return Ok(());
    }

    println!("Syncing every {}s. Press Ctrl+C to stop", cfg.sync.interval.as_secs());

    let (stop_tx, stop_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(()).await;
    });

    let mut indicator = queue.indicator();
    let runner = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.run(stop_rx).await })
    };
    let printer = tokio::spawn(async move {
        while indicator.changed().await.is_ok() {
            let state = indicator.borrow_and_update().clone();
            match state {
                SyncIndicator::Idle { pending } => println!("{} recording(s) waiting", pending),
                SyncIndicator::Syncing => println!("Syncing..."),
                SyncIndicator::Synced => println!("All recordings synced"),
                SyncIndicator::Offline => println!("Offline, will retry"),
                SyncIndicator::Unauthenticated => {
                    println!("Not signed in, set VOXSYNC_DRIVE_TOKEN")
                }
            }
        }
    });

    runner.await.context("Sync loop panicked")??;
    printer.abort();
    Ok(())
}

fn print_outcome(outcome: &PassOutcome) {
    match outcome {
        PassOutcome::Completed { synced: 0, failed: 0 } => println!("Nothing to sync"),
        PassOutcome::Completed { synced, failed } => {
            println!("Synced {} recording(s), {} failed", synced, failed)
        }
        PassOutcome::Skipped(SkipReason::Offline) => println!("Offline, nothing uploaded"),
        PassOutcome::Skipped(SkipReason::Unauthenticated) => {
            println!("Not signed in, set VOXSYNC_DRIVE_TOKEN or use the directory remote")
        }
        PassOutcome::Skipped(SkipReason::AlreadySyncing) => println!("A sync is already running"),
    }
}

/// Manual retry of failed recordings
async fn retry(id: Option<String>, all: bool) -> Result<()> {
    let cfg = config::config()?;
    let catalog = open_catalog(cfg)?;

    let ids: Vec<String> = if all {
        catalog
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.status == RecordingStatus::Failed)
            .map(|r| r.id)
            .collect()
    } else {
        id.into_iter().collect()
    };

    let mut reset = 0;
    for id in &ids {
        if catalog
            .reset_for_retry(id)
            .await
            .with_context(|| format!("Failed to reset recording {}", id))?
        {
            reset += 1;
        } else {
            println!("{} is already synced", short_id(id));
        }
    }

    println!("Queued {} recording(s) for retry", reset);
    Ok(())
}

/// Remove synced recordings from the catalog
async fn purge() -> Result<()> {
    let cfg = config::config()?;
    let catalog = open_catalog(cfg)?;
    let removed = catalog.delete_synced().await?;
    println!("Removed {} synced recording(s)", removed);
    Ok(())
}

/// Persist the capture device and mark setup complete
fn setup(device: &str) -> Result<()> {
    if device != "-" && !std::path::Path::new(device).exists() {
        anyhow::bail!("Capture device not found: {}", device);
    }

    let settings = JsonSettings::open_default()?;
    settings
        .set(CAPTURE_DEVICE, serde_json::Value::String(device.to_string()))
        .context("Failed to save capture device")?;
    settings
        .set(SETUP_COMPLETE, serde_json::Value::Bool(true))
        .context("Failed to save setup state")?;

    println!("Capture device set to {}", device);
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let settings = JsonSettings::open_default()?;

    println!("voxsync configuration");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Chunks:   {}", config::paths::chunks_dir_in(&cfg.home).display());
    println!("  Catalog:  {}", config::paths::catalog_db_in(&cfg.home).display());
    println!("  Settings: {}", config::paths::settings_file_in(&cfg.home).display());
    println!();
    println!("Capture:");
    println!("  Device:          {}", settings.capture_device().unwrap_or_else(|| "(not set)".to_string()));
    println!("  Flush interval:  {}s", cfg.capture.flush_interval.as_secs());
    println!("  Mime type:       {}", cfg.capture.mime_type);
    println!("  Folder template: {}", cfg.capture.folder_template);
    println!();
    println!("Sync:");
    println!("  Interval:        {}s", cfg.sync.interval.as_secs());
    println!("  Max retries:     {}", cfg.sync.max_retry_count);
    println!("  Upload timeout:  {}s", cfg.sync.upload_timeout.as_secs());
    println!("  Backoff:         {:?} (base {}s)", cfg.sync.backoff, cfg.sync.base_delay.as_secs());
    println!();
    println!("Remote:");
    println!("  Kind:            {:?}", cfg.remote.kind);
    println!("  Root folder:     {}", cfg.remote.root_folder);
    if let Some(dir) = &cfg.remote.directory {
        println!("  Directory:       {}", dir.display());
    }
    println!(
        "  Token:           {}",
        if cfg.remote.access_token.is_some() { "(set)" } else { "(not set)" }
    );

    Ok(())
}
