//! Retriable bounded-batch fetch over the op history endpoint.

use crate::error::SyncError;
use crate::service::{DeltaStorage, DocumentService};
use crate::types::SequencedMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Upper bound on ops requested per storage round-trip.
pub const MAX_BATCH_DELTAS: u64 = 2000;

/// Initial retry delay when a fetch produced no deltas.
pub const MISSING_FETCH_DELAY: Duration = Duration::from_millis(100);

/// Cap on the fetch retry delay.
pub const MAX_FETCH_DELAY: Duration = Duration::from_secs(10);

/// Delay before the `retry`-th consecutive empty attempt is repeated.
pub(crate) fn backoff_delay(retry: u32) -> Duration {
    let doubled = MISSING_FETCH_DELAY.saturating_mul(1u32 << retry.min(7));
    doubled.min(MAX_FETCH_DELAY)
}

/// Fetches sequenced ops from delta storage in bounded batches.
///
/// The storage handle is established lazily on first use and reused across
/// calls. A failure to establish it is fatal; post-connect failures retry
/// on the ladder unless the error says otherwise.
pub(crate) struct DeltaFetcher {
    service: Arc<dyn DocumentService>,
    storage: tokio::sync::Mutex<Option<Arc<dyn DeltaStorage>>>,
    closed: Arc<AtomicBool>,
}

impl DeltaFetcher {
    pub fn new(service: Arc<dyn DocumentService>, closed: Arc<AtomicBool>) -> Self {
        Self {
            service,
            storage: tokio::sync::Mutex::new(None),
            closed,
        }
    }

    async fn storage(&self) -> Result<Arc<dyn DeltaStorage>, SyncError> {
        let mut guard = self.storage.lock().await;
        if let Some(storage) = guard.as_ref() {
            return Ok(storage.clone());
        }
        let storage = self.service.connect_to_delta_storage().await?;
        *guard = Some(storage.clone());
        Ok(storage)
    }

    /// Fetch deltas after `from`, up to (exclusive) `to` when bounded.
    ///
    /// Unbounded fetches finish when the source is exhausted; bounded
    /// fetches finish once `to - 1` has been retrieved. Returns whatever
    /// was collected if the manager closes mid-fetch.
    pub async fn get_deltas(
        &self,
        reason: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<SequencedMessage>, SyncError> {
        let mut collected: Vec<SequencedMessage> = Vec::new();
        let mut from = from;
        let mut retry: u32 = 0;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(collected);
            }

            let max_fetch_to = from + MAX_BATCH_DELTAS;
            let fetch_to = to.map_or(max_fetch_to, |t| t.min(max_fetch_to));

            // Establishing the storage connection is the one non-retriable
            // step: if the history endpoint is unreachable nothing below
            // can make progress.
            let storage = self.storage().await?;

            let retrieved = match storage.get(from, fetch_to).await {
                Ok(deltas) => deltas,
                Err(err) => {
                    if !err.can_retry() {
                        tracing::warn!(reason, %err, "delta fetch failed fatally");
                        return Err(err);
                    }
                    let delay = err.retry_after().unwrap_or_else(|| backoff_delay(retry));
                    retry += 1;
                    tracing::debug!(
                        reason,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "delta fetch failed, retrying"
                    );
                    sleep(delay).await;
                    continue;
                }
            };

            let last_fetch = retrieved
                .last()
                .map_or(from, |message| message.sequence_number);
            let count = retrieved.len();
            collected.extend(retrieved);

            tracing::debug!(reason, from, fetch_to, count, "retrieved delta batch");

            match to {
                // Source exhausted: the batch came back short.
                None if last_fetch < max_fetch_to - 1 => return Ok(collected),
                Some(t) if t - 1 <= last_fetch => return Ok(collected),
                _ => {}
            }

            if count > 0 {
                retry = 0;
                from = last_fetch;
            } else {
                // The requested range exists but storage has not seen it
                // yet; wait for it to materialize.
                let delay = backoff_delay(retry);
                retry += 1;
                tracing::debug!(
                    reason,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "requested deltas not yet available"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_floor() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(6), Duration::from_millis(6400));
    }

    #[test]
    fn backoff_caps_at_max_fetch_delay() {
        assert_eq!(backoff_delay(7), MAX_FETCH_DELAY);
        assert_eq!(backoff_delay(20), MAX_FETCH_DELAY);
        assert_eq!(backoff_delay(u32::MAX), MAX_FETCH_DELAY);
    }
}
