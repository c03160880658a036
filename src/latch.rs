//! Single-shot completion primitive.

use crate::error::SyncError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

type PreWaitCallback = Arc<dyn Fn() + Send + Sync>;

enum State<T> {
    Pending(Vec<oneshot::Sender<Result<T, SyncError>>>),
    Resolved(T),
    Rejected(SyncError),
}

/// One producer resolves or rejects; any number of consumers await.
///
/// Completion is sticky: the first `resolve`/`reject` wins and later calls
/// are ignored.
pub struct Deferred<T: Clone> {
    state: Mutex<State<T>>,
    callback: Mutex<Option<PreWaitCallback>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
            callback: Mutex::new(None),
        }
    }

    /// Whether the latch has been resolved or rejected.
    pub fn is_completed(&self) -> bool {
        !matches!(*self.state.lock(), State::Pending(_))
    }

    /// Complete the latch successfully.
    pub fn resolve(&self, value: T) {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Resolved(value.clone());
                    waiters
                }
                _ => return,
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(value.clone()));
        }
    }

    /// Complete the latch with an error.
    pub fn reject(&self, error: SyncError) {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Rejected(error.clone());
                    waiters
                }
                _ => return,
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Install a callback that runs at the start of each `wait` call.
    ///
    /// Reserved hook: nothing in this crate installs one today. It exists
    /// for callers that must trigger work (a lazy request, a wake signal)
    /// before blocking on the latch.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    /// Wait for completion.
    pub async fn wait(&self) -> Result<T, SyncError> {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }

        let rx = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                State::Resolved(value) => return Ok(value.clone()),
                State::Rejected(error) => return Err(error.clone()),
            }
        };

        rx.await.unwrap_or(Err(SyncError::Closed))
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_wakes_all_waiters() {
        let latch = Arc::new(Deferred::<u32>::new());
        assert!(!latch.is_completed());

        let a = { let l = latch.clone(); tokio::spawn(async move { l.wait().await }) };
        let b = { let l = latch.clone(); tokio::spawn(async move { l.wait().await }) };
        tokio::task::yield_now().await;

        latch.resolve(7);
        assert!(latch.is_completed());
        assert_eq!(a.await.unwrap().unwrap(), 7);
        assert_eq!(b.await.unwrap().unwrap(), 7);

        // Late waiters see the stored value.
        assert_eq!(latch.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn first_completion_wins() {
        let latch = Deferred::<u32>::new();
        latch.reject(SyncError::Closed);
        latch.resolve(1);
        assert!(matches!(latch.wait().await, Err(SyncError::Closed)));
    }

    #[tokio::test]
    async fn callback_runs_before_wait() {
        let latch = Deferred::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        latch.set_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        latch.resolve(());
        latch.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
