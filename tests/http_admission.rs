use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use gatekeeper::http::{router, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
use gatekeeper::ratelimit::{ClientLimit, FailurePolicy, LimitRegistry, LimitTable, RateLimiter};
use gatekeeper::store::{InMemoryBackend, LocalStore, LocalStoreConfig, RemoteStore};

fn limits() -> Arc<LimitRegistry> {
    let table = LimitTable::new(ClientLimit::new(100, Duration::from_secs(60)))
        .with_client("client-2", ClientLimit::new(2, Duration::from_secs(60)));
    Arc::new(LimitRegistry::new(table))
}

fn local_app() -> axum::Router {
    let store = LocalStore::new(LocalStoreConfig::default()).unwrap();
    router(Arc::new(RateLimiter::new(Arc::new(store), limits())))
}

fn failing_app(policy: FailurePolicy) -> axum::Router {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_failing(true);
    let limiter =
        RateLimiter::new(Arc::new(RemoteStore::new(backend)), limits()).with_failure_policy(policy);
    router(Arc::new(limiter))
}

fn hello(client: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri("/api/hello");
    if let Some(client) = client {
        builder = builder.header("X-Client-ID", client);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn status_is_not_rate_limited() {
    let resp = local_app()
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(&LIMIT_HEADER).is_none());
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn allowed_request_carries_headers() {
    let resp = local_app().oneshot(hello(Some("client-2"))).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[&LIMIT_HEADER], "2");
    assert_eq!(resp.headers()[&REMAINING_HEADER], "1");
    assert!(resp.headers().get(&RESET_HEADER).is_some());

    let body = json_body(resp).await;
    assert_eq!(body["client_id"], "client-2");
}

#[tokio::test]
async fn missing_client_id_uses_default_sentinel() {
    let resp = local_app().oneshot(hello(None)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[&LIMIT_HEADER], "100");
    let body = json_body(resp).await;
    assert_eq!(body["client_id"], "default");
}

#[tokio::test]
async fn over_limit_returns_429() {
    let app = local_app();

    for _ in 0..2 {
        let resp = app.clone().oneshot(hello(Some("client-2"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = app.oneshot(hello(Some("client-2"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()[&REMAINING_HEADER], "0");
    assert!(resp.headers().get(&RESET_HEADER).is_some());

    let body = json_body(resp).await;
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["remaining"], 0);
    assert!(body["reset_at"].is_i64());
}

#[tokio::test]
async fn storage_failure_fail_open_passes_request() {
    let resp = failing_app(FailurePolicy::Open)
        .oneshot(hello(Some("client-2")))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[&REMAINING_HEADER], "2");
    assert!(resp.headers().get(&RESET_HEADER).is_none());
}

#[tokio::test]
async fn storage_failure_fail_closed_is_server_fault() {
    let resp = failing_app(FailurePolicy::Closed)
        .oneshot(hello(Some("client-2")))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "Rate limiter unavailable");
}

#[tokio::test]
async fn misconfigured_client_is_internal_error() {
    let registry = limits();
    registry.set_limit("broken", ClientLimit::new(0, Duration::from_secs(60)));
    let store = LocalStore::new(LocalStoreConfig::default()).unwrap();
    let app = router(Arc::new(RateLimiter::new(Arc::new(store), registry)));

    let resp = app.oneshot(hello(Some("broken"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
