use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub metadata: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized { trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid>, metadata: Option<serde_json::Value> },
    /// Upstream answered but the body was not usable (502).
    UpstreamUnusable { trace_id: Option<Uuid>, message: Option<String> },
    /// Every warm session was tried and none produced a response (503).
    ExhaustedAccounts { url: String, attempts: usize, trace_id: Option<Uuid> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
    pub fn not_found(code: &'static str) -> Self { Self::NotFound { code, trace_id: None, metadata: None } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::Unauthorized { trace_id } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody { code: "unauthorized".into(), trace_id, message: None, metadata: None },
                "unauthorized"
            ),
            ApiError::Forbidden { trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "forbidden".into(), trace_id, message: None, metadata: None },
                "forbidden"
            ),
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { code: code.into(), trace_id, message, metadata: None },
                code
            ),
            ApiError::NotFound { code, trace_id, metadata } => (
                StatusCode::NOT_FOUND,
                ErrorBody { code: code.into(), trace_id, message: None, metadata },
                code
            ),
            ApiError::UpstreamUnusable { trace_id, message } => (
                StatusCode::BAD_GATEWAY,
                ErrorBody { code: "upstream_unusable".into(), trace_id, message, metadata: None },
                "upstream_unusable"
            ),
            ApiError::ExhaustedAccounts { url, attempts, trace_id } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: "exhausted_accounts".into(),
                    trace_id,
                    message: Some(if attempts == 0 {
                        "no warm session available".to_string()
                    } else {
                        format!("no session produced a response for {url} after {attempts} attempts")
                    }),
                    metadata: None,
                },
                "exhausted_accounts"
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { code: "internal_error".into(), trace_id, message, metadata: None },
                "internal_error"
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
