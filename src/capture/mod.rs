//! Capture device abstraction.
//!
//! A device is acquired once per session and yields [`Fragment`]s over a
//! channel until it runs dry or the stream is dropped. The recorder never
//! talks to hardware directly; hosts plug in a [`CaptureDevice`]:
//!
//! - [`ReaderDevice`]: raw bytes from a file, FIFO, or stdin (pipe `arecord`
//!   or `ffmpeg` into it)
//! - [`ChannelDevice`]: fragments pushed by the host application

pub mod reader;

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};

pub use reader::{CaptureSource, ReaderDevice};

/// A slice of encoded audio delivered by a device
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub data: Vec<u8>,

    /// Input level in `0.0..=1.0`, for UI feedback only
    pub level: f32,
}

impl Fragment {
    pub fn new(data: Vec<u8>) -> Self {
        let level = peak_level(&data);
        Self { data, level }
    }
}

/// An acquired device: a fragment channel plus the container mime type
pub struct CaptureStream {
    fragments: mpsc::Receiver<Fragment>,
    mime_type: String,
}

impl CaptureStream {
    pub fn new(fragments: mpsc::Receiver<Fragment>, mime_type: impl Into<String>) -> Self {
        Self {
            fragments,
            mime_type: mime_type.into(),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Next fragment, or `None` once the device is exhausted (cancel-safe)
    pub async fn next_fragment(&mut self) -> Option<Fragment> {
        self.fragments.recv().await
    }

    /// A fragment that has already arrived, without waiting
    pub fn try_next_fragment(&mut self) -> Option<Fragment> {
        self.fragments.try_recv().ok()
    }
}

/// Source of captured audio
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Acquire the device, failing with `CaptureUnavailable`
    async fn acquire(&self) -> EngineResult<CaptureStream>;
}

/// Device fed by the host through a channel; can be acquired once
pub struct ChannelDevice {
    name: String,
    mime_type: String,
    receiver: Mutex<Option<mpsc::Receiver<Fragment>>>,
}

impl ChannelDevice {
    /// Create a device and the sender the host pushes fragments into
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Sender<Fragment>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let device = Self {
            name: name.into(),
            mime_type: mime_type.into(),
            receiver: Mutex::new(Some(rx)),
        };
        (device, tx)
    }
}

#[async_trait]
impl CaptureDevice for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self) -> EngineResult<CaptureStream> {
        let mut guard = match self.receiver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rx = guard
            .take()
            .ok_or_else(|| EngineError::CaptureUnavailable(format!("{} already in use", self.name)))?;
        Ok(CaptureStream::new(rx, self.mime_type.clone()))
    }
}

/// Peak amplitude of 16-bit little-endian PCM, normalized to `0.0..=1.0`.
///
/// For compressed containers this is only a rough activity indicator.
pub fn peak_level(data: &[u8]) -> f32 {
    data.chunks_exact(2)
        .map(|pair| (i16::from_le_bytes([pair[0], pair[1]]) as i32).unsigned_abs())
        .max()
        .map(|peak| (peak as f32 / 32768.0).min(1.0))
        .unwrap_or(0.0)
}
