//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Process-wide node stop signal."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug)]
struct ShutdownInner {
    stopped: watch::Sender<bool>,
    requests: AtomicUsize,
    failure: Mutex<Option<String>>,
}

/// Stop signal shared by everything that may halt the node.
///
/// Stopping is idempotent: only the first request changes state.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                stopped,
                requests: AtomicUsize::new(0),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Request the node to stop. Returns `true` if this call stopped it.
    pub fn request_stop(&self) -> bool {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let first = self.inner.stopped.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if first {
            info!("node stop requested");
        }
        first
    }

    /// Record `reason` as the node failure (first one wins) and stop.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut failure = self.inner.failure.lock();
            if failure.is_none() {
                *failure = Some(reason);
            } else {
                warn!(%reason, "additional failure after node failure was recorded");
            }
        }
        self.request_stop()
    }

    pub fn is_running(&self) -> bool {
        !*self.inner.stopped.borrow()
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// Number of stop requests seen, including redundant ones.
    pub fn stop_requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Resolve once the node has been asked to stop.
    pub async fn wait(&self) {
        let mut rx = self.inner.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(signal.is_running());
        assert!(signal.request_stop());
        assert!(!signal.request_stop());
        assert!(!signal.is_running());
        assert_eq!(signal.stop_requests(), 2);
        assert!(signal.failure().is_none());
    }

    #[test]
    fn first_failure_is_kept() {
        let signal = ShutdownSignal::new();
        assert!(signal.fail("first"));
        assert!(!signal.fail("second"));
        assert_eq!(signal.failure().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn wait_resolves_after_stop() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        signal.request_stop();
        waiter.await.expect("waiter completes");
        // Already stopped: returns immediately.
        signal.wait().await;
    }
}
