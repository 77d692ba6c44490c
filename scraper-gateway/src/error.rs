use common_http_errors::ApiError;
use thiserror::Error;

/// Failures of the upstream-request fabric. Rate-limit and invalid-session
/// conditions never appear here; the authenticator digests those into pool
/// feedback and retries on another session.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no session produced a response for {url} after {attempts} attempts")]
    ExhaustedAccounts { url: String, attempts: usize },
    #[error("account pool is empty")]
    PoolEmpty,
    #[error("upstream resource not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("upstream response unusable: {0}")]
    Parse(String),
}

impl From<ScrapeError> for ApiError {
    fn from(err: ScrapeError) -> Self {
        match err {
            ScrapeError::ExhaustedAccounts { url, attempts } => {
                ApiError::ExhaustedAccounts { url, attempts, trace_id: None }
            }
            ScrapeError::PoolEmpty => ApiError::ExhaustedAccounts {
                url: String::new(),
                attempts: 0,
                trace_id: None,
            },
            ScrapeError::NotFound => ApiError::not_found("not_found"),
            ScrapeError::InvalidInput(code) => ApiError::bad_request(code, None),
            ScrapeError::Parse(message) => ApiError::UpstreamUnusable {
                trace_id: None,
                message: Some(message),
            },
        }
    }
}
