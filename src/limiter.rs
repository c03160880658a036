//! Bounded-concurrency scheduler for service requests.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default number of concurrently outstanding requests.
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 24;

/// Counting-semaphore scheduler; waiters are served in FIFO order.
#[derive(Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Run `task` once a permit is available.
    ///
    /// The permit is released when the task completes, whether it succeeds
    /// or fails.
    pub async fn schedule<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("rate limiter semaphore is never closed");
        task.await
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENT_REQUESTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_never_exceeds_permit_count()  {
        let limiter = RateLimiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                limiter
                    .schedule(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn permit_released_on_failure() {
        let limiter = RateLimiter::new(1);
        let _: Result<(), ()> = limiter.schedule(async { Err(()) }).await;
        // A leaked permit would deadlock here.
        limiter.schedule(async {}).await;
    }
}
