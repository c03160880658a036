//! Pausable FIFO queues feeding async workers.
//!
//! Each pipeline stage owns one queue and one worker task. The worker
//! dequeues a single item, awaits its handler, then proceeds; a handler
//! error pauses the queue and is reported through the error sink the queue
//! was constructed with.

use crate::error::SyncError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Callback invoked when a worker's handler fails.
pub type ErrorSink = Arc<dyn Fn(SyncError) + Send + Sync>;

struct QueueState<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    paused: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

/// A FIFO queue of pipeline work items.
///
/// Starts paused. The mutex guards only the deque and is never held across
/// an await; pause/resume/close are lock-free flags checked by the worker
/// loop.
pub struct MessageQueue<T> {
    state: Arc<QueueState<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> MessageQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            state: Arc::new(QueueState {
                name,
                items: Mutex::new(VecDeque::new()),
                paused: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.state.name
    }

    /// Append an item. Items pushed onto a closed queue are dropped.
    pub fn push(&self, item: T) {
        if self.state.closed.load(Ordering::Acquire) {
            return;
        }
        self.state.items.lock().push_back(item);
        self.state.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.lock().is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::Acquire)
    }

    /// Stop dequeuing. The item currently being processed completes.
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::Release);
        self.state.notify.notify_one();
    }

    /// Drop all queued items.
    pub fn clear(&self) {
        self.state.items.lock().clear();
    }

    /// Terminally close the queue; the worker exits at its next dequeue.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.items.lock().clear();
        self.state.notify.notify_one();
    }

    /// Await the next item, honoring pause and close.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.state.notify.notified();
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            if !self.state.paused.load(Ordering::Acquire) {
                if let Some(item) = self.state.items.lock().pop_front() {
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Spawn the worker task for this queue.
    ///
    /// The handler processes one item at a time; an `Err` pauses the queue
    /// and reports through `on_error`. The task exits when the queue
    /// closes.
    pub fn spawn_worker<F>(&self, mut handler: F, on_error: ErrorSink) -> JoinHandle<()>
    where
        F: FnMut(T) -> BoxFuture<'static, Result<(), SyncError>> + Send + 'static,
    {
        let queue = self.clone();
        tokio::spawn(async move {
            while let Some(item) = queue.dequeue().await {
                if let Err(err) = handler(item).await {
                    tracing::warn!(queue = queue.name(), %err, "queue handler failed");
                    queue.pause();
                    on_error(err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn sink() -> (ErrorSink, Arc<Mutex<Vec<SyncError>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let captured = errors.clone();
        (
            Arc::new(move |e| captured.lock().push(e)),
            errors,
        )
    }

    #[tokio::test]
    async fn worker_drains_in_fifo_order_after_resume() {
        let queue: MessageQueue<u32> = MessageQueue::new("inbound");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (on_error, _) = sink();

        let sink_clone = seen.clone();
        queue.spawn_worker(
            move |item| {
                let seen = sink_clone.clone();
                Box::pin(async move {
                    seen.lock().push(item);
                    Ok(())
                })
            },
            on_error,
        );

        queue.push(1);
        queue.push(2);
        queue.push(3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty(), "queue starts paused");

        queue.resume();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn handler_error_pauses_and_reports() {
        let queue: MessageQueue<u32> = MessageQueue::new("inbound");
        let processed = Arc::new(AtomicUsize::new(0));
        let (on_error, errors) = sink();

        let counter = processed.clone();
        queue.spawn_worker(
            move |item| {
                let counter = counter.clone();
                Box::pin(async move {
                    if item == 2 {
                        return Err(SyncError::Invariant("boom".into()));
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
            on_error,
        );

        queue.resume();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert!(queue.is_paused());
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(queue.len(), 1, "item after the failure stays queued");
    }

    #[tokio::test]
    async fn clear_drops_pending_items() {
        let queue: MessageQueue<u32> = MessageQueue::new("outbound");
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn close_terminates_worker() {
        let queue: MessageQueue<u32> = MessageQueue::new("signal");
        let (on_error, _) = sink();
        let worker = queue.spawn_worker(|_| Box::pin(async { Ok(()) }), on_error);
        queue.close();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker exits on close")
            .unwrap();
        queue.push(9);
        assert!(queue.is_empty(), "pushes after close are dropped");
    }
}
