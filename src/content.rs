//! Bounded side-channel buffer for out-of-band op contents.
//!
//! Contents are keyed by `(client_id, client_sequence_number)`. For a given
//! client the side channel delivers monotonically increasing client
//! sequence numbers, so the resolution loop may discard older entries while
//! seeking a match.

use crate::types::ContentMessage;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Default capacity of the content buffer.
pub const DEFAULT_CONTENT_BUFFER_SIZE: usize = 10;

type ContentKey = (String, u64);

struct CacheInner {
    /// Global arrival order; the eviction policy is FIFO across clients.
    entries: VecDeque<ContentMessage>,
    waiters: HashMap<ContentKey, Vec<oneshot::Sender<Value>>>,
    evicted: u64,
}

/// Bounded buffer correlating content attachments with sequenced messages.
pub struct ContentCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl ContentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: VecDeque::new(),
                waiters: HashMap::new(),
                evicted: 0,
            }),
            capacity,
        }
    }

    /// Store an attachment, waking any waiter registered for its key.
    ///
    /// A delivered-to-waiter attachment is consumed and not buffered.
    pub fn set(&self, message: ContentMessage) {
        let key = (
            message.client_id.clone(),
            message.client_sequence_number,
        );
        let waiters = {
            let mut inner = self.inner.lock();
            match inner.waiters.remove(&key) {
                Some(waiters) => waiters,
                None => {
                    if inner.entries.len() >= self.capacity {
                        inner.entries.pop_front();
                        inner.evicted += 1;
                        tracing::debug!(
                            evicted_total = inner.evicted,
                            "content buffer full, evicting oldest entry"
                        );
                    }
                    inner.entries.push_back(message);
                    return;
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(message.contents.clone());
        }
    }

    /// Client sequence number of the oldest buffered entry for `client_id`.
    pub fn peek(&self, client_id: &str) -> Option<u64> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|entry| entry.client_id == client_id)
            .map(|entry| entry.client_sequence_number)
    }

    /// Remove and return the oldest buffered entry for `client_id`.
    pub fn take(&self, client_id: &str) -> Option<ContentMessage> {
        let mut inner = self.inner.lock();
        let position = inner
            .entries
            .iter()
            .position(|entry| entry.client_id == client_id)?;
        inner.entries.remove(position)
    }

    /// Register a one-shot waiter for a specific key.
    ///
    /// The receiver fires when a matching attachment arrives; the caller is
    /// responsible for its own fallback when the wait is abandoned.
    pub fn wait_for(&self, client_id: &str, client_sequence_number: u64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .waiters
            .entry((client_id.to_string(), client_sequence_number))
            .or_default()
            .push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total entries dropped by FIFO eviction.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_BUFFER_SIZE)
    }
}
