//! Epoch tracking: binds every request and cached artifact to the
//! monotonic server-assigned epoch, invalidating local state on
//! divergence.

use crate::cache::{CacheEntry, FileEntry, PersistentCache};
use crate::error::SyncError;
use crate::latch::Deferred;
use crate::limiter::{RateLimiter, DEFAULT_CONCURRENT_REQUESTS};
use crate::types::ConnectionDetails;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Header carrying the server epoch on responses (and on requests when the
/// URL is too long for the query parameter).
pub const EPOCH_HEADER: &str = "x-fluid-epoch";

/// Longest URL the epoch query parameter may produce before the tracker
/// falls back to the header.
pub const MAX_URL_LENGTH: usize = 2048;

/// Request class, used for telemetry and the redemption rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchType {
    Blob,
    CreateBlob,
    CreateFile,
    JoinSession,
    Ops,
    SnapshotTree,
    TreesLatest,
    UploadSummary,
    Push,
    Versions,
    Other,
}

impl fmt::Display for FetchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchType::Blob => "blob",
            FetchType::CreateBlob => "createBlob",
            FetchType::CreateFile => "createFile",
            FetchType::JoinSession => "joinSession",
            FetchType::Ops => "ops",
            FetchType::SnapshotTree => "snapshotTree",
            FetchType::TreesLatest => "treesLatest",
            FetchType::UploadSummary => "uploadSummary",
            FetchType::Push => "push",
            FetchType::Versions => "versions",
            FetchType::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Description of one service request before epoch annotation.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// A validated response.
#[derive(Clone, Debug)]
pub struct FetchResult<T> {
    pub content: T,
    pub status: u16,
    /// Epoch the response carried, if any.
    pub epoch: Option<String>,
    pub duration: Duration,
}

/// Tracks the server epoch and gates the persistent cache on it.
///
/// The tracker is the sole writer of the epoch and the sole authority over
/// the persistent cache; all epoch-scoped requests flow through its shared
/// rate limiter.
pub struct EpochTracker {
    client: reqwest::Client,
    cache: Arc<dyn PersistentCache>,
    limiter: RateLimiter,
    epoch: Mutex<Option<String>>,
    file_entry: Mutex<Option<FileEntry>>,
}

impl EpochTracker {
    /// Create a tracker around the host cache.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client fails to build (e.g. TLS backend issues).
    pub fn new(cache: Arc<dyn PersistentCache>) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            cache,
            limiter: RateLimiter::new(DEFAULT_CONCURRENT_REQUESTS),
            epoch: Mutex::new(None),
            file_entry: Mutex::new(None),
        }
    }

    /// The currently known epoch, if one has been learned.
    pub fn epoch(&self) -> Option<String> {
        self.epoch.lock().clone()
    }

    /// Bind the tracker to a file. Settable once.
    pub fn set_file_entry(&self, entry: FileEntry) -> Result<(), SyncError> {
        let mut slot = self.file_entry.lock();
        if slot.is_some() {
            return Err(SyncError::Invariant("file entry is already set".into()));
        }
        *slot = Some(entry);
        Ok(())
    }

    /// Scheduler shared by all epoch-scoped requests.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Perform a request and parse the validated response as JSON.
    pub async fn fetch_and_parse_json<T: DeserializeOwned>(
        &self,
        url: &str,
        request: FetchRequest,
        fetch_type: FetchType,
        add_in_body: bool,
    ) -> Result<FetchResult<T>, SyncError> {
        let raw = self
            .fetch_response(url, request, fetch_type, add_in_body)
            .await?;
        let content: T = serde_json::from_slice(&raw.content)?;
        Ok(FetchResult {
            content,
            status: raw.status,
            epoch: raw.epoch,
            duration: raw.duration,
        })
    }

    /// Perform a request and return the validated raw response body.
    pub async fn fetch_response(
        &self,
        url: &str,
        mut request: FetchRequest,
        fetch_type: FetchType,
        add_in_body: bool,
    ) -> Result<FetchResult<Bytes>, SyncError> {
        let start = Instant::now();
        let final_url = self.annotate(url, &mut request, add_in_body);

        let send = {
            let client = &self.client;
            let request = &request;
            let final_url = &final_url;
            async move {
                let mut builder = client.request(request.method.clone(), final_url.as_str());
                for (key, value) in &request.headers {
                    builder = builder.header(key.as_str(), value.as_str());
                }
                if let Some(body) = request.body.clone() {
                    builder = builder.body(body);
                }
                builder.send().await
            }
        };
        let response = self.limiter.schedule(send).await?;

        let status = response.status();
        let response_epoch = response
            .headers()
            .get(EPOCH_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let err = error_from_response(status, &final_url, &response);
            tracing::debug!(fetch_type = %fetch_type, status = status.as_u16(), %err, "request failed");
            return Err(self
                .handle_epoch_error(err, response_epoch.as_deref(), fetch_type)
                .await);
        }

        if let Err(err) = self.validate_epoch(response_epoch.as_deref(), fetch_type) {
            return Err(self
                .handle_epoch_error(err, response_epoch.as_deref(), fetch_type)
                .await);
        }

        let content = response.bytes().await.map_err(SyncError::from)?;
        Ok(FetchResult {
            content,
            status: status.as_u16(),
            epoch: response_epoch,
            duration: start.elapsed(),
        })
    }

    /// Read an entry through the epoch gate.
    ///
    /// Entries written under a different epoch purge the file's cache and
    /// surface the mismatch.
    pub async fn fetch_from_cache<T: DeserializeOwned>(
        &self,
        entry: &CacheEntry,
        max_op_count: Option<u64>,
        fetch_type: FetchType,
    ) -> Result<Option<T>, SyncError> {
        let Some(cached) = self.cache.get(entry, max_op_count).await? else {
            return Ok(None);
        };
        if let Err(err) = self.validate_epoch(cached.fluid_epoch.as_deref(), fetch_type) {
            return Err(self
                .handle_epoch_error(err, cached.fluid_epoch.as_deref(), fetch_type)
                .await);
        }
        Ok(Some(serde_json::from_value(cached.value)?))
    }

    /// Validate (or learn) the epoch delivered with a realtime join.
    pub async fn validate_epoch_from_push(
        &self,
        details: &ConnectionDetails,
    ) -> Result<(), SyncError> {
        if let Err(err) = self.validate_epoch(details.epoch.as_deref(), FetchType::Push) {
            return Err(self
                .handle_epoch_error(err, details.epoch.as_deref(), FetchType::Push)
                .await);
        }
        Ok(())
    }

    /// Stamp the current epoch onto an outgoing request.
    ///
    /// Returns the URL to use; the request's headers or body may have been
    /// amended.
    fn annotate(&self, url: &str, request: &mut FetchRequest, add_in_body: bool) -> String {
        let Some(epoch) = self.epoch() else {
            return url.to_string();
        };
        if add_in_body {
            if let Some(body) = &mut request.body {
                *body = insert_epoch_in_multipart(body, &epoch);
            }
            return url.to_string();
        }
        let candidate = append_query(url, "epoch", &epoch);
        if candidate.len() > MAX_URL_LENGTH {
            request.headers.push((EPOCH_HEADER.to_string(), epoch));
            url.to_string()
        } else {
            candidate
        }
    }

    fn validate_epoch(
        &self,
        response_epoch: Option<&str>,
        fetch_type: FetchType,
    ) -> Result<(), SyncError> {
        // Some endpoints omit the epoch entirely.
        let Some(response_epoch) = response_epoch else {
            return Ok(());
        };
        let mut current = self.epoch.lock();
        match current.as_deref() {
            None => {
                tracing::info!(epoch = response_epoch, fetch_type = %fetch_type, "EpochLearnedFirstTime");
                *current = Some(response_epoch.to_string());
                Ok(())
            }
            Some(local) if local == response_epoch => Ok(()),
            Some(local) => Err(SyncError::EpochMismatch {
                message: format!("epoch changed from {local} to {response_epoch}"),
            }),
        }
    }

    /// Decide what an epoch-mismatch-shaped error really is.
    ///
    /// A rejection whose response epoch agrees with ours is a
    /// write-coherency conflict and becomes a throttle; a true divergence
    /// purges the file's cache before surfacing.
    async fn handle_epoch_error(
        &self,
        err: SyncError,
        response_epoch: Option<&str>,
        fetch_type: FetchType,
    ) -> SyncError {
        if !matches!(err, SyncError::EpochMismatch { .. }) {
            return err;
        }
        if let (Some(local), Some(remote)) = (self.epoch(), response_epoch) {
            if local == remote {
                tracing::debug!(fetch_type = %fetch_type, "coherency conflict, translating to throttle");
                return SyncError::Throttled {
                    retry_after: Duration::from_secs(1),
                    status: 429,
                };
            }
        }
        if let Err(purge_err) = self.purge_file_cache().await {
            tracing::warn!(%purge_err, "cache purge after epoch mismatch failed");
        }
        err
    }

    async fn purge_file_cache(&self) -> Result<(), SyncError> {
        let Some(file) = self.file_entry.lock().clone() else {
            return Err(SyncError::Invariant(
                "cache purge requested before the file entry was set".into(),
            ));
        };
        tracing::warn!(doc_id = %file.doc_id, "purging cached entries after epoch mismatch");
        self.cache.remove_entries(&file).await
    }
}

fn error_from_response(status: StatusCode, url: &str, response: &reqwest::Response) -> SyncError {
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(1));
        return SyncError::Throttled {
            retry_after,
            status: 429,
        };
    }
    SyncError::from_status(status, url)
}

/// Insert `epoch=<value>` as a form field after the first multipart
/// boundary line.
fn insert_epoch_in_multipart(body: &str, epoch: &str) -> String {
    match body.split_once("\r\n") {
        Some((boundary, rest)) => format!("{boundary}\r\nepoch={epoch}\r\n{rest}"),
        None => body.to_string(),
    }
}

/// Append a query parameter, respecting an existing query string.
fn append_query(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{key}={value}")
}

/// Epoch tracker that additionally coordinates the first-storage-access
/// race.
///
/// The latch is resolved by any successful response; a join rejected with
/// 404 before that point waits for it and retries once. A failed
/// `TreesLatest` rejects the latch so blocked joins fail with the same
/// error instead of hanging.
pub struct RedeemingEpochTracker {
    tracker: Arc<EpochTracker>,
    redeemed: Deferred<()>,
}

impl RedeemingEpochTracker {
    pub fn new(tracker: Arc<EpochTracker>) -> Self {
        Self {
            tracker,
            redeemed: Deferred::new(),
        }
    }

    pub fn inner(&self) -> &Arc<EpochTracker> {
        &self.tracker
    }

    pub async fn fetch_and_parse_json<T: DeserializeOwned>(
        &self,
        url: &str,
        request: FetchRequest,
        fetch_type: FetchType,
        add_in_body: bool,
    ) -> Result<FetchResult<T>, SyncError> {
        let completed_at_entry = self.redeemed.is_completed();
        match self
            .tracker
            .fetch_and_parse_json(url, request.clone(), fetch_type, add_in_body)
            .await
        {
            Ok(result) => {
                self.redeemed.resolve(());
                Ok(result)
            }
            Err(err) => match fetch_type {
                FetchType::TreesLatest => {
                    self.redeemed.reject(err.clone());
                    Err(err)
                }
                FetchType::JoinSession
                    if err.status_code() == Some(404) && !completed_at_entry =>
                {
                    tracing::debug!("join rejected before first storage access, waiting");
                    self.redeemed.wait().await?;
                    self.tracker
                        .fetch_and_parse_json(url, request, fetch_type, add_in_body)
                        .await
                }
                _ => Err(err),
            },
        }
    }
}
