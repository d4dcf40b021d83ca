use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics_consts::{WORKER_POOL_IN_FLIGHT, WORKER_POOL_SATURATION};

/// Fixed-size pool that runs submitted futures on the tokio runtime, never
/// more than `size` at once.
///
/// Admission is FIFO since tokio semaphores are fair. Each spawned task owns
/// its permit, so the slot comes back when the task ends, including when it
/// panics.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_flight(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    /// Wait for a free slot, then spawn `task`. Returns as soon as the task is
    /// spawned; the caller never sees its result.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Only happens once the pool has been closed, which we never do
                warn!("worker pool semaphore closed, dropping task");
                return;
            }
        };
        report_utilization(&self.semaphore, self.size);

        let semaphore = self.semaphore.clone();
        let size = self.size;
        tokio::spawn(async move {
            task.await;
            drop(permit);
            report_utilization(&semaphore, size);
        });
    }

    /// Wait until every running task has finished. Returns false if `timeout`
    /// elapsed first; running tasks are left alone either way.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.semaphore.acquire_many(self.size as u32);
        match tokio::time::timeout(timeout, all).await {
            Ok(Ok(_permits)) => {
                debug!("worker pool drained");
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    "timed out waiting for worker pool to drain"
                );
                false
            }
        }
    }
}

fn report_utilization(semaphore: &Semaphore, size: usize) {
    let in_flight = size - semaphore.available_permits();
    metrics::gauge!(WORKER_POOL_IN_FLIGHT).set(in_flight as f64);
    metrics::gauge!(WORKER_POOL_SATURATION).set(in_flight as f64 / size as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_size() {
        let pool = WorkerPool::new(3);
        let gauge = Arc::new(Gauge::default());

        for _ in 0..20 {
            let gauge = gauge.clone();
            pool.submit(async move {
                let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                gauge.current.fetch_sub(1, Ordering::SeqCst);
                gauge.finished.fetch_add(1, Ordering::SeqCst);
            })
            .await;
            assert!(pool.in_flight() <= 3);
        }

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 20);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_its_slot() {
        let pool = WorkerPool::new(1);
        pool.submit(async { panic!("worker blew up") }).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        pool.submit(async move {
            flag.store(1, Ordering::SeqCst);
        })
        .await;

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_task() {
        let pool = WorkerPool::new(2);
        pool.submit(std::future::pending()).await;

        assert!(!pool.drain(Duration::from_millis(50)).await);
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
