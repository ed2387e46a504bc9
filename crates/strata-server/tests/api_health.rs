use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strata_db::{Manager, PoolConfig};
use strata_server::{app, AppState};
use tower::ServiceExt;
use tracing::Span;

fn open_manager(dir: &tempfile::TempDir) -> Arc<Manager> {
    let mut config = PoolConfig::new(dir.path().join("health.db").to_string_lossy().into_owned());
    config.max_open = 2;
    config.max_idle = 1;
    config.acquire_timeout = Duration::from_secs(2);
    Arc::new(Manager::new(&config, Span::none()).expect("manager should open"))
}

async fn get_health(state: AppState) -> (StatusCode, Value) {
    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_pool_stats() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = open_manager(&dir);

    let (status, json) = get_health(AppState { db }).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pool"]["max_open"], 2);
    assert_eq!(json["pool"]["in_use"], 0);
}

#[tokio::test]
async fn health_is_unavailable_after_close() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = open_manager(&dir);
    db.close().expect("close should succeed");

    let (status, json) = get_health(AppState { db }).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "unavailable");
    assert_eq!(json["error"], "database connection is closed");
}
