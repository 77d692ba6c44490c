mod support;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use scraper_gateway::routes::build_router;
use tower::ServiceExt;

#[tokio::test]
async fn healthz_is_unauthenticated() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    let response = build_router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn metrics_render_in_prometheus_text_format() {
    let server = MockServer::start_async().await;
    let h = support::gateway(&server.base_url(), 1);
    h.state.metrics.record_upstream_status(200);
    h.state.metrics.set_active_sessions(2);

    let response = build_router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gateway_upstream_requests_total"));
    assert!(text.contains("gateway_active_sessions 2"));
}
