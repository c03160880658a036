//! Error types for the delta synchronization core.

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Main error type for delta stream and epoch operations.
///
/// Service implementations map their transport failures into these
/// variants; anything without explicit retryability information belongs in
/// [`SyncError::Network`], which is treated as retryable.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Transient failure; retried on the backoff ladder.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Server asked the client to back off.
    #[error("throttled (status {status})")]
    Throttled { retry_after: Duration, status: u16 },

    /// Unrecoverable failure; the manager closes.
    #[error("fatal failure: {message}")]
    Fatal { message: String },

    /// The requested resource does not exist (yet).
    #[error("not found: {url}")]
    NotFound { url: String },

    /// The server epoch diverged from the locally known one.
    #[error("epoch version mismatch: {message}")]
    EpochMismatch { message: String },

    /// Transport-level failure with no structured error shape.
    #[error("network error: {0}")]
    Network(String),

    /// Internal state drifted from a protocol invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Payload failed to parse.
    #[error("json error: {0}")]
    Json(String),

    /// The manager (or tracker) was closed.
    #[error("closed")]
    Closed,
}

impl SyncError {
    /// Build an error from an HTTP status code.
    ///
    /// 409 is the epoch-mismatch signal on this wire; whether it is a true
    /// divergence or a write-coherency conflict is decided by the epoch
    /// tracker, which compares the response epoch before surfacing it.
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        match status.as_u16() {
            409 => SyncError::EpochMismatch {
                message: format!("server rejected epoch for {url}"),
            },
            429 => SyncError::Throttled {
                retry_after: Duration::from_secs(1),
                status: 429,
            },
            404 => SyncError::NotFound {
                url: url.to_string(),
            },
            s if s >= 500 => SyncError::Transient {
                message: format!("server error {s} from {url}"),
                retry_after: None,
            },
            s => SyncError::Fatal {
                message: format!("unexpected status {s} from {url}"),
            },
        }
    }

    /// Whether the operation that produced this error may be retried.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            SyncError::Transient { .. } | SyncError::Throttled { .. } | SyncError::Network(_)
        )
    }

    /// Server-requested retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Transient { retry_after, .. } => *retry_after,
            SyncError::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// HTTP status code if applicable.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Throttled { status, .. } => Some(*status),
            SyncError::EpochMismatch { .. } => Some(409),
            SyncError::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(SyncError::Network("reset".into()).can_retry());
        assert!(SyncError::Transient {
            message: "503".into(),
            retry_after: None
        }
        .can_retry());
        assert!(SyncError::Throttled {
            retry_after: Duration::from_secs(1),
            status: 429
        }
        .can_retry());
        assert!(!SyncError::Fatal {
            message: "bad token".into()
        }
        .can_retry());
        assert!(!SyncError::EpochMismatch {
            message: "diverged".into()
        }
        .can_retry());
        assert!(!SyncError::Closed.can_retry());
        assert!(!SyncError::Invariant("gap".into()).can_retry());
    }

    #[test]
    fn status_mapping() {
        let url = "https://example.com/ops";
        match SyncError::from_status(StatusCode::CONFLICT, url) {
            SyncError::EpochMismatch { .. } => {}
            other => panic!("expected epoch mismatch, got {other:?}"),
        }
        match SyncError::from_status(StatusCode::TOO_MANY_REQUESTS, url) {
            SyncError::Throttled { status: 429, .. } => {}
            other => panic!("expected throttled, got {other:?}"),
        }
        assert!(SyncError::from_status(StatusCode::BAD_GATEWAY, url).can_retry());
        assert!(!SyncError::from_status(StatusCode::FORBIDDEN, url).can_retry());
        assert_eq!(
            SyncError::from_status(StatusCode::NOT_FOUND, url).status_code(),
            Some(404)
        );
    }

    #[test]
    fn retry_after_surfaces_server_hint() {
        let err = SyncError::Transient {
            message: "throttle hint".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(SyncError::Network("x".into()).retry_after(), None);
    }
}
