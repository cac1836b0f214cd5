//! Recording CLI commands.
//!
//! - `voxsync record` - Capture until Ctrl+C, the duration elapses, or input ends
//! - `voxsync recover` - Rebuild recordings from sessions interrupted by a crash

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::capture::{CaptureDevice, CaptureSource, ReaderDevice};
use crate::config::{self, ResolvedConfig};
use crate::core::{Recorder, RecorderConfig, RecoveryReport};
use crate::domain::SessionEvent;
use crate::error::EngineError;
use crate::settings::{JsonSettings, Settings};

use super::{open_catalog, open_chunks};

/// Wire a recorder over the on-disk stores
fn build_recorder(cfg: &ResolvedConfig, device: Arc<dyn CaptureDevice>) -> Result<Recorder> {
    let config = RecorderConfig {
        lock_path: Some(config::paths::recorder_lock_in(&cfg.home)),
        ..RecorderConfig::from(&cfg.capture)
    };

    Ok(Recorder::new(
        Arc::new(open_chunks(cfg)),
        Arc::new(open_catalog(cfg)?),
        device,
        config,
    ))
}

/// Run crash recovery; skipped while another process is recording
pub(crate) async fn recover_with(cfg: &ResolvedConfig) -> Result<RecoveryReport> {
    // Recovery never acquires the device
    let device = Arc::new(ReaderDevice::new(CaptureSource::Stdin, cfg.capture.mime_type.clone()));
    let mut recorder = build_recorder(cfg, device)?;
    run_recovery(&mut recorder).await
}

async fn run_recovery(recorder: &mut Recorder) -> Result<RecoveryReport> {
    match recorder.recover().await {
        Ok(report) => Ok(report),
        Err(EngineError::SessionConflict(reason)) => {
            warn!("Skipping crash recovery: {}", reason);
            Ok(RecoveryReport::default())
        }
        Err(e) => Err(e).context("Crash recovery failed"),
    }
}

/// Rebuild recordings from interrupted sessions
pub async fn execute_recover() -> Result<()> {
    let cfg = config::config()?;
    let report = recover_with(cfg).await?;

    if report.total() == 0 {
        println!("No interrupted sessions found");
        return Ok(());
    }

    for id in &report.recovered {
        println!("Recovered recording {}", id);
    }
    if report.discarded > 0 {
        println!("Discarded {} empty session(s)", report.discarded);
    }
    if report.already_finalized > 0 {
        println!("Cleaned up {} already finalized session(s)", report.already_finalized);
    }
    if report.failed > 0 {
        println!("{} session(s) could not be recovered, see logs", report.failed);
    }

    Ok(())
}

/// Record from the chosen source
pub async fn execute_record(input: Option<String>, duration: Option<Duration>) -> Result<()> {
    let cfg = config::config()?;

    let source = match input {
        Some(input) => input,
        None => JsonSettings::open_default()?
            .capture_device()
            .context("No capture device configured. Run `voxsync setup --device PATH` or pass --input")?,
    };

    let device = ReaderDevice::new(CaptureSource::parse(&source), cfg.capture.mime_type.clone());
    let mut recorder = build_recorder(cfg, Arc::new(device))?;

    let report = run_recovery(&mut recorder).await?;
    if !report.recovered.is_empty() {
        println!("Recovered {} interrupted recording(s)", report.recovered.len());
    }

    let mut events = recorder
        .take_events()
        .context("Recorder events already taken")?;
    let session_id = recorder
        .start()
        .await
        .context("Failed to start recording")?;

    println!("Recording session {} from {}", session_id, source);
    println!("    Press Ctrl+C to stop");
    println!();

    // Set up Ctrl+C handler
    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(());
    });

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = &mut deadline => break,
            Some(event) = events.recv() => match event {
                SessionEvent::ChunkSaved { sequence, size_bytes, .. } => {
                    println!("Chunk {} saved ({} bytes)", sequence, size_bytes);
                }
                SessionEvent::InputEnded { .. } => {
                    println!("Input ended");
                    break;
                }
                SessionEvent::Error { message, .. } => eprintln!("Warning: {}", message),
                _ => {}
            },
        }
    }

    let elapsed = recorder.elapsed();
    println!();
    println!("Stopping after {}s...", elapsed.as_secs());

    match recorder.stop().await.context("Failed to finalize recording")? {
        Some(id) => println!("Saved recording {} (run `voxsync sync` to upload)", id),
        None => println!("Nothing was captured"),
    }

    Ok(())
}
