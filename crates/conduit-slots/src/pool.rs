//! Bounded worker pool for long-running slot work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Tracing target for the worker pool.
const TRACING_TARGET: &str = "conduit_slots::pool";

/// Runs at most `size` jobs at a time; further jobs queue and are never dropped.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool running up to `size` jobs concurrently.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            size,
        }
    }

    /// Returns the number of concurrent jobs.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of jobs running or waiting for a permit.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Queues `job`.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.tracker.spawn(async move {
            let permit = semaphore.acquire_owned().await;
            if permit.is_err() {
                tracing::error!(target: TRACING_TARGET, "Worker pool semaphore closed");
            }
            let output = job.await;
            drop(permit);
            output
        })
    }

    /// Waits for every queued and running job.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(target: TRACING_TARGET, "Worker pool drained");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn limits_concurrency_and_queues_the_rest() -> anyhow::Result<()> {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await?);
        }

        assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
        assert_eq!(pool.pending(), 0);
        Ok(())
    }
}
