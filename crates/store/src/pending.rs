//! In-flight request tracking for orderly shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Poll interval of [`PendingRequests::wait_idle`]
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Log every this many polls while waiting
const LOG_EVERY: u32 = 100;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicU64,
    idle: Notify,
}

/// Counts requests a store has issued but not yet seen complete
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

/// Keeps one request counted until dropped
#[derive(Debug)]
#[must_use = "the request stops being tracked when the guard drops"]
pub struct PendingGuard {
    inner: Arc<Inner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request until the returned guard drops
    pub fn begin(&self) -> PendingGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        PendingGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Resolve once no request is pending
    pub async fn wait_idle(&self, label: &str) {
        let mut polls = 0u32;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = self.count();
            if pending == 0 {
                return;
            }
            polls += 1;
            if polls % LOG_EVERY == 0 {
                info!("{label}: waiting for {pending} pending requests");
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_idle_returns_when_guards_drop() {
        let pending = PendingRequests::new();
        let guard = pending.begin();
        let second = pending.begin();
        assert_eq!(pending.count(), 2);

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
            drop(second);
        });
        pending.wait_idle("test").await;
        assert_eq!(pending.count(), 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_without_requests() {
        PendingRequests::new().wait_idle("idle").await;
    }
}
