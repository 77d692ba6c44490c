use crate::app_state::AppState;
use crate::handlers::{
    admin_auth_middleware, bearer_auth_middleware, delete_account, force_login, get_all_tweets,
    get_community_members, get_followers, get_following, get_profile, get_tweet,
    get_tweets_and_replies, import_accounts, issue_token, list_accounts, list_tokens,
    reset_failed_accounts, revoke_token, search_people, search_tweets,
};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use std::time::Instant;
use tracing::{info, warn};

async fn health() -> &'static str {
    "ok"
}

/// One line per request with timing.
async fn request_logger(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "{} {} -> {} ({:.2}ms)",
        method,
        uri,
        response.status().as_u16(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    response
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let bearer_state = state.clone();
    let scrape = Router::new()
        .route("/api/tweets/:id", get(get_tweet))
        .route("/api/users/:handle", get(get_profile))
        .route(
            "/api/users/:id_or_handle/tweets-and-replies",
            get(get_tweets_and_replies),
        )
        .route("/api/users/:id_or_handle/following", get(get_following))
        .route("/api/users/:id_or_handle/followers", get(get_followers))
        .route("/api/users/:id_or_handle/all-tweets", get(get_all_tweets))
        .route("/api/search/people/:query", get(search_people))
        .route("/api/search/tweets/:query", get(search_tweets))
        .route("/api/communities/:id/members", get(get_community_members))
        .layer(middleware::from_fn(move |request, next| {
            let state = bearer_state.clone();
            async move { bearer_auth_middleware(state, request, next).await }
        }));

    let admin_state = state.clone();
    let admin = Router::new()
        .route("/api/accounts/import", post(import_accounts))
        .route("/api/accounts/login", post(force_login))
        .route("/api/accounts/reset-failed", post(reset_failed_accounts))
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/:username", delete(delete_account))
        .route("/api/tokens", post(issue_token).get(list_tokens))
        .route("/api/tokens/:id", delete(revoke_token))
        .layer(middleware::from_fn(move |request, next| {
            let state = admin_state.clone();
            async move { admin_auth_middleware(state, request, next).await }
        }));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(scrape)
        .merge(admin)
        .layer(middleware::from_fn(request_logger))
        .with_state(state)
}
