//! Epoch protocol scenarios driven over real HTTP against a mock server.

use async_trait::async_trait;
use delta_sync::{
    CacheEntry, CachedValue, EpochTracker, FetchRequest, FetchType, FileEntry, PersistentCache,
    RedeemingEpochTracker, SyncError, DEFAULT_CONCURRENT_REQUESTS,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct MockCache {
    entries: Mutex<HashMap<String, CachedValue>>,
    removed: Mutex<Vec<FileEntry>>,
}

impl MockCache {
    fn put(&self, key: &str, value: CachedValue) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn removed(&self) -> Vec<FileEntry> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl PersistentCache for MockCache {
    async fn get(
        &self,
        entry: &CacheEntry,
        _max_op_count: Option<u64>,
    ) -> Result<Option<CachedValue>, SyncError> {
        Ok(self.entries.lock().get(&entry.key).cloned())
    }

    async fn remove_entries(&self, file: &FileEntry) -> Result<(), SyncError> {
        self.removed.lock().push(file.clone());
        self.entries.lock().clear();
        Ok(())
    }
}

fn file_entry() -> FileEntry {
    FileEntry {
        doc_id: "doc-1".to_string(),
        resolved_url: "https://service/doc-1".to_string(),
    }
}

fn tracker() -> (Arc<EpochTracker>, Arc<MockCache>) {
    let cache = Arc::new(MockCache::default());
    let tracker = Arc::new(EpochTracker::new(cache.clone()));
    tracker.set_file_entry(file_entry()).unwrap();
    (tracker, cache)
}

async fn epoch_response(server: &MockServer, route: &str, epoch: &str, times: Option<u64>) {
    let mut mock = Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-fluid-epoch", epoch)
                .set_body_string("{\"ok\":true}"),
        );
    if let Some(times) = times {
        mock = mock.up_to_n_times(times);
    }
    mock.mount(server).await;
}

#[tokio::test]
async fn epoch_is_learned_then_mismatch_purges_once() {
    let server = MockServer::start().await;
    epoch_response(&server, "/data", "A", Some(3)).await;
    epoch_response(&server, "/data", "B", None).await;

    let (tracker, cache) = tracker();
    let url = format!("{}/data", server.uri());

    for _ in 0..3 {
        let result = tracker
            .fetch_and_parse_json::<Value>(&url, FetchRequest::get(), FetchType::Ops, false)
            .await
            .unwrap();
        assert_eq!(result.epoch.as_deref(), Some("A"));
    }
    assert_eq!(tracker.epoch().as_deref(), Some("A"));

    let err = tracker
        .fetch_and_parse_json::<Value>(&url, FetchRequest::get(), FetchType::Ops, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::EpochMismatch { .. }));
    assert_eq!(cache.removed(), vec![file_entry()]);
}

#[tokio::test]
async fn coherency_conflict_translates_to_throttle_without_purge() {
    let server = MockServer::start().await;
    epoch_response(&server, "/data", "A", Some(1)).await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            ResponseTemplate::new(409)
                .insert_header("x-fluid-epoch", "A")
                .set_body_string("conflict"),
        )
        .mount(&server)
        .await;

    let (tracker, cache) = tracker();
    let url = format!("{}/data", server.uri());

    tracker
        .fetch_and_parse_json::<Value>(&url, FetchRequest::get(), FetchType::Ops, false)
        .await
        .unwrap();

    let err = tracker
        .fetch_and_parse_json::<Value>(&url, FetchRequest::get(), FetchType::Ops, false)
        .await
        .unwrap_err();
    match err {
        SyncError::Throttled {
            retry_after,
            status,
        } => {
            assert_eq!(retry_after, Duration::from_secs(1));
            assert_eq!(status, 429);
        }
        other => panic!("expected throttled, got {other:?}"),
    }
    assert!(cache.removed().is_empty());
}

#[tokio::test]
async fn learned_epoch_annotates_requests_as_query_param() {
    let server = MockServer::start().await;
    epoch_response(&server, "/learn", "A", None).await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(query_param("epoch", "A"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-fluid-epoch", "A")
                .set_body_string("{\"ok\":true}"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (tracker, _cache) = tracker();
    tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/learn", server.uri()),
            FetchRequest::get(),
            FetchType::TreesLatest,
            false,
        )
        .await
        .unwrap();

    tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/data", server.uri()),
            FetchRequest::get(),
            FetchType::Ops,
            false,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn learned_epoch_annotates_multipart_bodies() {
    let server = MockServer::start().await;
    epoch_response(&server, "/learn", "A", None).await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_string_contains("epoch=A"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&server)
        .await;

    let (tracker, _cache) = tracker();
    tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/learn", server.uri()),
            FetchRequest::get(),
            FetchType::TreesLatest,
            false,
        )
        .await
        .unwrap();

    let body = "--boundary123\r\nContent-Disposition: form-data; name=\"snapshot\"\r\n\r\n{}\r\n--boundary123--";
    tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/upload", server.uri()),
            FetchRequest::post(body),
            FetchType::UploadSummary,
            true,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn cached_entries_from_another_epoch_are_purged() {
    let server = MockServer::start().await;
    epoch_response(&server, "/learn", "A", None).await;

    let (tracker, cache) = tracker();
    tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/learn", server.uri()),
            FetchRequest::get(),
            FetchType::TreesLatest,
            false,
        )
        .await
        .unwrap();

    let entry = CacheEntry {
        file: file_entry(),
        entry_type: "snapshot".to_string(),
        key: "snap-1".to_string(),
    };

    cache.put(
        "snap-1",
        CachedValue {
            fluid_epoch: Some("A".to_string()),
            value: json!({"tree": 1}),
        },
    );
    let hit: Option<Value> = tracker
        .fetch_from_cache(&entry, None, FetchType::SnapshotTree)
        .await
        .unwrap();
    assert_eq!(hit, Some(json!({"tree": 1})));

    cache.put(
        "snap-1",
        CachedValue {
            fluid_epoch: Some("B".to_string()),
            value: json!({"tree": 2}),
        },
    );
    let err = tracker
        .fetch_from_cache::<Value>(&entry, None, FetchType::SnapshotTree)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::EpochMismatch { .. }));
    assert_eq!(cache.removed().len(), 1);
}

#[tokio::test]
async fn join_session_blocked_on_404_retries_after_redemption() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trees-latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-fluid-epoch", "A")
                .set_body_string("{\"ok\":true}")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/join"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not yet"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/join"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-fluid-epoch", "A")
                .set_body_string("{\"session\":\"s1\"}"),
        )
        .mount(&server)
        .await;

    let (inner, _cache) = tracker();
    let tracker = Arc::new(RedeemingEpochTracker::new(inner));

    let trees = {
        let tracker = tracker.clone();
        let url = format!("{}/trees-latest", server.uri());
        tokio::spawn(async move {
            tracker
                .fetch_and_parse_json::<Value>(&url, FetchRequest::get(), FetchType::TreesLatest, false)
                .await
        })
    };

    // The join hits 404 while trees-latest is still in flight, waits for
    // it, then retries exactly once.
    let join = tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/join", server.uri()),
            FetchRequest::get(),
            FetchType::JoinSession,
            false,
        )
        .await
        .unwrap();
    assert_eq!(join.content, json!({"session": "s1"}));
    trees.await.unwrap().unwrap();

    let joins = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/join")
        .count();
    assert_eq!(joins, 2);
}

#[tokio::test]
async fn trees_latest_failure_rejects_blocked_joins() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trees-latest"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_string("down")
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/join"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not yet"))
        .mount(&server)
        .await;

    let (inner, _cache) = tracker();
    let tracker = Arc::new(RedeemingEpochTracker::new(inner));

    let join = {
        let tracker = tracker.clone();
        let url = format!("{}/join", server.uri());
        tokio::spawn(async move {
            tracker
                .fetch_and_parse_json::<Value>(&url, FetchRequest::get(), FetchType::JoinSession, false)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let trees = tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/trees-latest", server.uri()),
            FetchRequest::get(),
            FetchType::TreesLatest,
            false,
        )
        .await;
    assert!(trees.is_err());

    // The blocked join fails with the rejection instead of hanging.
    let join_result = join.await.unwrap();
    assert!(matches!(join_result, Err(SyncError::Transient { .. })));

    let joins = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/join")
        .count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn completed_redemption_means_404_propagates() {
    let server = MockServer::start().await;
    epoch_response(&server, "/trees-latest", "A", None).await;
    Mock::given(method("GET"))
        .and(path("/join"))
        .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
        .mount(&server)
        .await;

    let (inner, _cache) = tracker();
    let tracker = RedeemingEpochTracker::new(inner);

    tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/trees-latest", server.uri()),
            FetchRequest::get(),
            FetchType::TreesLatest,
            false,
        )
        .await
        .unwrap();

    // Redemption already happened; a 404 now is a real failure.
    let err = tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/join", server.uri()),
            FetchRequest::get(),
            FetchType::JoinSession,
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(404));

    let joins = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/join")
        .count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn throttle_response_carries_retry_after_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let (tracker, _cache) = tracker();
    let err = tracker
        .fetch_and_parse_json::<Value>(
            &format!("{}/data", server.uri()),
            FetchRequest::get(),
            FetchType::Ops,
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[test]
fn default_request_concurrency_matches_protocol() {
    assert_eq!(DEFAULT_CONCURRENT_REQUESTS, 24);
}
