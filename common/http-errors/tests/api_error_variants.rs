use common_http_errors::ApiError;
use axum::response::IntoResponse;
use axum::body::to_bytes;
use axum::http::StatusCode;
use uuid::Uuid;

#[test]
fn unauthorized_variant() {
    let err = ApiError::Unauthorized { trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "unauthorized");
}

#[test]
fn bad_request_variant() {
    let err = ApiError::BadRequest { code: "invalid_handle", trace_id: None, message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_handle");
}

#[test]
fn not_found_carries_metadata() {
    let err = ApiError::NotFound {
        code: "tweet_not_found",
        trace_id: None,
        metadata: Some(serde_json::json!({"tweetId": "123"})),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "tweet_not_found");
}

#[test]
fn internal_variant_includes_trace_id() {
    let trace = Some(Uuid::new_v4());
    let err = ApiError::Internal { trace_id: trace, message: Some("boom".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}

#[tokio::test]
async fn exhausted_accounts_shape() {
    let err = ApiError::ExhaustedAccounts {
        url: "https://upstream/graphql/UserByScreenName".into(),
        attempts: 3,
        trace_id: None,
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "exhausted_accounts");
    let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"code\":\"exhausted_accounts\""));
    assert!(body.contains("3 attempts"));
}

#[tokio::test]
async fn upstream_unusable_shape() {
    let err = ApiError::UpstreamUnusable { trace_id: None, message: Some("missing result".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"code\":\"upstream_unusable\""));
}
