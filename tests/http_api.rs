use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::Value;
use tower::ServiceExt;
use verdant::cache::{CacheConfig, CacheState, Hook, HookOutcome};
use verdant::domain::node::ROOT_ID;
use verdant::infra::http::{HttpState, build_router};
use verdant::infra::memory::InMemorySource;

fn app(config: CacheConfig) -> (Router, Arc<CacheState>, Arc<InMemorySource>) {
    let source = Arc::new(InMemorySource::new());
    source.upsert(1, ROOT_ID, 0, 1, "page");
    source.upsert(2, 1, 0, 2, "page");
    source.upsert(3, 1, 10, 2, "article");

    let cache = Arc::new(CacheState::new(config, source.clone()));
    let router = build_router(HttpState::new(cache.clone()));
    (router, cache, source)
}

fn memory_only() -> CacheConfig {
    CacheConfig {
        disk_cache_enabled: false,
        ..Default::default()
    }
}

async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn nodes_endpoint_lists_top_level_content() {
    let (router, _, _) = app(memory_only());

    let (status, body) = send(&router, Method::GET, "/nodes").await;
    assert_eq!(status, StatusCode::OK);
    let nodes = body.as_array().expect("array");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["id"], 1);
    assert_eq!(nodes[0]["children"], serde_json::json!([2, 3]));
}

#[tokio::test]
async fn children_come_back_in_sort_order() {
    let (router, _, _) = app(memory_only());

    let (status, body) = send(&router, Method::GET, "/nodes/1/children").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body
        .as_array()
        .expect("array")
        .iter()
        .map(|node| node["id"].as_i64().expect("id"))
        .collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(body[1]["content_type"], "article");
    assert_eq!(body[1]["level"], 2);
}

#[tokio::test]
async fn unknown_node_is_404() {
    let (router, _, _) = app(memory_only());

    let (status, _) = send(&router, Method::GET, "/nodes/404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::GET, "/nodes/404/children").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_unpopulated_tree() {
    let (router, cache, source) = app(memory_only());
    source.set_available(false);

    let (status, body) = send(&router, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["populated"], false);
    assert!(body["last_failure"].is_string());

    source.set_available(true);
    cache.refresh_all().await.expect("refresh");
    let (status, body) = send(&router, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"], 3);
}

#[tokio::test]
async fn republish_all_rebuilds_from_source() {
    let (router, cache, source) = app(memory_only());
    cache.snapshot().await;
    source.upsert(4, 2, 0, 3, "page");

    let (status, body) = send(&router, Method::POST, "/admin/republish").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"], 4);
    assert!(cache.snapshot().await.contains(4));
}

#[tokio::test]
async fn cancelled_republish_is_a_bad_request() {
    let (router, cache, _) = app(memory_only());
    cache
        .hooks()
        .register("freeze", Hook::before_refresh(|| HookOutcome::Cancel));

    let (status, _) = send(&router, Method::POST, "/admin/republish").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn republish_subtree_reports_counts() {
    let (router, cache, source) = app(memory_only());
    cache.snapshot().await;
    source.remove(3);

    let (status, body) = send(&router, Method::POST, "/admin/republish/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["root_id"], 1);
    assert_eq!(body["published"], serde_json::json!([1, 2]));
    assert_eq!(body["skipped"], serde_json::json!([3]));
    assert_eq!(body["rebuilt"], false);
}

#[tokio::test]
async fn requests_flush_pending_changes_to_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = CacheConfig::with_snapshot_path(dir.path().join("published.json"));
    let path = config.snapshot_path.clone();
    let (router, cache, _) = app(config);

    let (status, _) = send(&router, Method::GET, "/nodes").await;
    assert_eq!(status, StatusCode::OK);

    // The write is spawned after the response; wait for it to land.
    for _ in 0..50 {
        if !cache.persistence().is_dirty() && path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(path.exists());
    assert!(!cache.persistence().is_dirty());
}
