//! Persistent cache interface for file-scoped, epoch-stamped artifacts.
//!
//! The epoch tracker is the sole reader and the sole authority on entry
//! admissibility: entries stamped with a different epoch than the current
//! one are purged en masse.

use crate::error::SyncError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of the file all cache entries are scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub doc_id: String,
    pub resolved_url: String,
}

/// Key of one cached artifact within a file's scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheEntry {
    pub file: FileEntry,
    /// Artifact class, e.g. `"snapshot"` or `"ops"`.
    pub entry_type: String,
    pub key: String,
}

/// Stored value plus the epoch it was written under.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluid_epoch: Option<String>,
    pub value: Value,
}

/// Host-provided persistent cache.
#[async_trait]
pub trait PersistentCache: Send + Sync {
    /// Look up an entry. `max_op_count` lets op-snapshot readers bound how
    /// stale an entry they will accept.
    async fn get(
        &self,
        entry: &CacheEntry,
        max_op_count: Option<u64>,
    ) -> Result<Option<CachedValue>, SyncError>;

    /// Remove every entry scoped to `file`.
    async fn remove_entries(&self, file: &FileEntry) -> Result<(), SyncError>;
}
