//! Bounded parallel job runner with progress and cooperative cancellation
//!
//! Jobs are independent leaves: there are no dependency edges between them.
//! At most `max_in_flight` jobs run at once, which bounds peak memory when
//! every job holds a file window or a block in memory. Async jobs that await
//! a block-store future yield their worker thread while waiting.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll interval used while waiting on running jobs
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Progress sink (`done` out of `total`)
pub trait Progress: Send + Sync {
    fn on_progress(&self, total: usize, done: usize);
}

/// Dispatches batches of independent jobs onto the tokio runtime
#[derive(Clone)]
pub struct JobRunner {
    max_in_flight: usize,
    progress: Option<Arc<dyn Progress>>,
    cancel: Option<CancellationToken>,
}

impl JobRunner {
    /// Runner allowing `max_in_flight` concurrent jobs (at least one)
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Run async jobs; results come back in job order
    pub async fn run<T, Fut>(&self, label: &str, jobs: Vec<Fut>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.drive(label, jobs, |set, index, job| {
            set.spawn(async move { (index, job.await) });
        })
        .await
    }

    /// Run blocking jobs (file I/O, hashing, compression) on the blocking pool
    pub async fn run_blocking<T, F>(&self, label: &str, jobs: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.drive(label, jobs, |set, index, job| {
            set.spawn_blocking(move || (index, job()));
        })
        .await
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn report(&self, total: usize, done: usize) {
        if let Some(progress) = &self.progress {
            progress.on_progress(total, done);
        }
    }

    async fn drive<J, T>(
        &self,
        label: &str,
        jobs: Vec<J>,
        spawn: impl Fn(&mut JoinSet<(usize, Result<T>)>, usize, J),
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
    {
        let total = jobs.len();
        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<Error> = None;
        let mut failed = 0usize;
        let mut done = 0usize;
        let mut cancelled = false;
        let mut set = JoinSet::new();
        let mut pending = jobs.into_iter().enumerate();

        debug!("{label}: dispatching {total} jobs, {} in flight", self.max_in_flight);
        self.report(total, 0);

        loop {
            if !cancelled && self.is_cancelled() {
                debug!("{label}: cancellation observed, draining {} running jobs", set.len());
                cancelled = true;
            }
            while !cancelled && set.len() < self.max_in_flight {
                match pending.next() {
                    Some((index, job)) => spawn(&mut set, index, job),
                    None => break,
                }
            }
            if set.is_empty() {
                break;
            }

            let joined = match tokio::time::timeout(POLL_INTERVAL, set.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    debug!("{label}: waiting on {} jobs ({done}/{total} done)", set.len());
                    continue;
                }
            };

            done += 1;
            match joined {
                Ok((index, Ok(value))) => results[index] = Some(value),
                Ok((index, Err(e))) => {
                    warn!("{label}: job {index} failed: {e}");
                    failed += 1;
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!("{label}: job aborted: {e}");
                    failed += 1;
                    first_error.get_or_insert(e.into());
                }
            }
            if !cancelled {
                self.report(total, done);
            }
        }

        if cancelled {
            return Err(Error::Cancelled);
        }
        if let Some(e) = first_error {
            warn!("{label}: {failed} of {total} jobs failed");
            return Err(e);
        }
        results
            .into_iter()
            .map(|r| r.ok_or_else(|| Error::Internal(format!("{label}: job produced no result"))))
            .collect()
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        )
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("max_in_flight", &self.max_in_flight)
            .field("progress", &self.progress.is_some())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
