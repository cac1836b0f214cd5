//! Network reachability checks used to skip sync passes while offline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::core::sync_queue::{SyncNotifier, SyncTrigger};

/// Reports whether the remote is reachable
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Online when a TCP connection to `host:port` succeeds in time
pub struct TcpProbe {
    host: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connectivity for TcpProbe {
    async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.host)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host = %self.host, "Connectivity probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(host = %self.host, "Connectivity probe timed out");
                false
            }
        }
    }
}

/// Online flag flipped by the host (e.g. from OS network notifications)
pub struct ManualConnectivity {
    online: AtomicBool,
    notifier: Mutex<Option<SyncNotifier>>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            notifier: Mutex::new(None),
        }
    }

    /// Request a sync pass whenever connectivity comes back
    pub fn attach(&self, notifier: SyncNotifier) {
        let mut slot = match self.notifier.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(notifier);
    }

    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            let slot = match self.notifier.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(notifier) = slot.as_ref() {
                notifier.notify(SyncTrigger::Reconnect);
            }
        }
    }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_emits_trigger() {
        let (notifier, mut triggers) = SyncNotifier::channel();
        let connectivity = ManualConnectivity::new(false);
        connectivity.attach(notifier);

        assert!(!connectivity.is_online().await);
        connectivity.set_online(true);
        assert!(connectivity.is_online().await);
        assert_eq!(triggers.try_recv().unwrap(), SyncTrigger::Reconnect);

        // Staying online is not a reconnect
        connectivity.set_online(true);
        assert!(triggers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.is_online().await);

        drop(listener);
        let closed = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(!closed.is_online().await);
    }
}
