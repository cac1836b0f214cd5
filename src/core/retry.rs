//! Retry scheduling for failed uploads.
//!
//! With [`BackoffMode::Fixed`] every retryable entry is due on every pass, so
//! retries happen once per sync interval. [`BackoffMode::Exponential`] spaces
//! attempts out by `base * multiplier^(n-1)`, capped at the sync interval,
//! minus a deterministic jitter derived from the entry id.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::{BackoffMode, SyncSettings};
use crate::domain::Recording;

/// Largest share of the delay removed by jitter
const MAX_JITTER: f64 = 0.2;

/// When a failed upload becomes eligible again
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub mode: BackoffMode,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any delay
    pub max_delay: Duration,

    /// delay *= multiplier after each retry
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for BackoffPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            mode: settings.backoff,
            base_delay: settings.base_delay,
            max_delay: settings.interval,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Reproduces a plain retry-every-pass schedule
    pub fn fixed() -> Self {
        Self {
            mode: BackoffMode::Fixed,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.mode == BackoffMode::Fixed || attempt == 0 {
            return Duration::ZERO;
        }

        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi((attempt - 1) as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay with the entry's jitter applied
    pub fn jittered_delay(&self, id: &str, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        delay.mul_f64(1.0 - MAX_JITTER * jitter_fraction(id, attempt))
    }

    /// Whether a recording may be attempted at `now`
    pub fn is_due(&self, recording: &Recording, now: DateTime<Utc>) -> bool {
        if recording.retry_count == 0 {
            return true;
        }
        let Some(last_retry_at) = recording.last_retry_at else {
            return true;
        };

        let delay = self.jittered_delay(&recording.id, recording.retry_count);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => last_retry_at + delay <= now,
            Err(_) => false,
        }
    }
}

/// Stable value in `0.0..1.0` for an (id, attempt) pair
fn jitter_fraction(id: &str, attempt: u32) -> f64 {
    let digest = Sha256::new()
        .chain_update(id.as_bytes())
        .chain_update(attempt.to_be_bytes())
        .finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordingStatus;
    use uuid::Uuid;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            mode: BackoffMode::Exponential,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    fn failed(retry_count: u32, last_retry_at: Option<DateTime<Utc>>) -> Recording {
        Recording {
            id: "rec-1".to_string(),
            session_id: Uuid::new_v4(),
            captured_at: Utc::now(),
            duration_seconds: 1,
            destination_path: vec![],
            file_name: "a.webm".to_string(),
            status: RecordingStatus::Failed,
            synced_flag: false,
            remote_file_id: None,
            retry_count,
            last_retry_at,
            last_error: Some("boom".to_string()),
            size_bytes: 1,
            mime_type: "audio/webm".to_string(),
            recovered: false,
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let policy = policy();
        for attempt in 1..6 {
            let a = policy.jittered_delay("rec-1", attempt);
            let b = policy.jittered_delay("rec-1", attempt);
            assert_eq!(a, b);

            let full = policy.delay_for_attempt(attempt);
            assert!(a <= full);
            assert!(a >= full.mul_f64(1.0 - MAX_JITTER));
        }
    }

    #[test]
    fn test_due_after_delay() {
        let policy = policy();
        let now = Utc::now();

        assert!(policy.is_due(&failed(0, None), now));
        assert!(!policy.is_due(&failed(1, Some(now)), now));
        assert!(policy.is_due(&failed(1, Some(now - chrono::Duration::seconds(5))), now));
        assert!(policy.is_due(&failed(4, Some(now - chrono::Duration::seconds(30))), now));
    }

    #[test]
    fn test_fixed_mode_is_always_due() {
        let policy = BackoffPolicy::fixed();
        let now = Utc::now();

        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
        assert!(policy.is_due(&failed(3, Some(now)), now));
    }
}
