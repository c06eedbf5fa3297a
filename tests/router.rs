mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use common::{test_config, TEST_CLEAN_UP_TIMEOUT};
use racetrack_pub::replicas::ReplicaDiscovery;
use racetrack_pub::server::{build_router, Services};
use racetrack_pub::storage::MemoryTaskStorage;
use racetrack_pub::task_store::{AsyncTaskStore, LONG_POLL_TIMEOUT};

async fn test_router() -> anyhow::Result<axum::Router> {
    let cfg = test_config("http://127.0.0.1:1/lifecycle")?;
    let discovery = ReplicaDiscovery::new_static(Vec::new(), "127.0.0.1:7205");
    let store = AsyncTaskStore::with_timeouts(
        discovery,
        Arc::new(MemoryTaskStorage::new()),
        LONG_POLL_TIMEOUT,
        TEST_CLEAN_UP_TIMEOUT,
    )?;
    let services = Services::init_with(cfg, store)?;
    Ok(build_router(services))
}

#[tokio::test]
async fn live_and_ready_respond_on_both_mounts() -> anyhow::Result<()> {
    let app = test_router().await?;
    for path in ["/live", "/ready", "/pub/live", "/pub/ready"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK, "path: {path}");
    }
    Ok(())
}

#[tokio::test]
async fn health_reports_service_and_auth_flag() -> anyhow::Result<()> {
    let app = test_router().await?;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await?.to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["service"], "pub");
    assert_eq!(body["status"], "pass");
    assert_eq!(body["auth_required"], true);
    Ok(())
}

#[tokio::test]
async fn local_status_of_unknown_task_is_404() -> anyhow::Result<()> {
    let app = test_router().await?;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/pub/async/task/no-such-task/status/local")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = response.into_body().collect().await?.to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert!(body["error"].is_string(), "body: {body}");
    assert!(body["requestId"].is_string(), "body: {body}");
    Ok(())
}

#[tokio::test]
async fn remote_ws_route_is_absent_outside_gateway_mode() -> anyhow::Result<()> {
    let app = test_router().await?;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/pub/remote/ws")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}
