//! Downstream REST surface. Scrape endpoints sit behind issued-token
//! bearer auth; account and token management sit behind the operator's
//! admin password.

use crate::app_state::AppState;
use crate::error::ScrapeError;
use crate::import::ImportFormat;
use crate::upstream::{SearchMode, DEFAULT_LIST_ITEMS};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

// ---------------- middleware ----------------

pub async fn bearer_auth_middleware(
    state: AppState,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim))
        .ok_or(ApiError::Unauthorized { trace_id: None })?;
    if !state.tokens.validate(token) {
        return Err(ApiError::Unauthorized { trace_id: None });
    }
    state.tokens.touch(token);
    Ok(next.run(request).await)
}

pub async fn admin_auth_middleware(
    state: AppState,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_password.as_deref() else {
        return Err(ApiError::Forbidden { trace_id: None });
    };
    let headers = request.headers();
    let header_password = headers
        .get("X-Admin-Password")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let cookie_password = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| {
            cookie::Cookie::split_parse(raw.to_string())
                .filter_map(Result::ok)
                .find(|c| c.name() == "admin_password")
                .map(|c| c.value().to_string())
        });
    let supplied = header_password.or(cookie_password);
    match supplied {
        Some(password) if constant_time_eq(&password, expected) => Ok(next.run(request).await),
        _ => Err(ApiError::Forbidden { trace_id: None }),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------- scrape endpoints ----------------

#[derive(Deserialize)]
pub struct TweetParams {
    #[serde(default)]
    pub use_account: bool,
}

pub async fn get_tweet(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TweetParams>,
) -> ApiResult<Json<Value>> {
    let fetched_with = if params.use_account { "account" } else { "guest" };
    match state.upstream.tweet_by_id(&id, params.use_account).await {
        Ok(tweet) => Ok(Json(json!({
            "tweet": tweet,
            "metadata": { "tweetId": id, "fetchedWith": fetched_with }
        }))),
        Err(ScrapeError::NotFound) => Err(ApiError::NotFound {
            code: "tweet_not_found",
            trace_id: None,
            metadata: Some(json!({ "tweetId": id, "fetchedWith": fetched_with })),
        }),
        Err(err) => Err(err.into()),
    }
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Json<Value>> {
    let screen_name = match handle.strip_prefix('@') {
        Some(screen_name) if !screen_name.is_empty() => screen_name,
        _ => return Err(ApiError::bad_request("invalid_handle", None)),
    };
    match state.upstream.profile_by_screen_name(screen_name).await {
        Ok(profile) => Ok(Json(json!({ "profile": profile }))),
        Err(ScrapeError::NotFound) => Err(ApiError::NotFound {
            code: "user_not_found",
            trace_id: None,
            metadata: Some(json!({ "handle": handle })),
        }),
        Err(err) => Err(err.into()),
    }
}

#[derive(Deserialize)]
pub struct UntilParams {
    pub until: Option<usize>,
}

pub async fn get_tweets_and_replies(
    State(state): State<AppState>,
    Path(id_or_handle): Path<String>,
    Query(params): Query<UntilParams>,
) -> ApiResult<Json<Value>> {
    let user_id = state.upstream.resolve_user_id(&id_or_handle).await?;
    let max_items = params.until.unwrap_or(DEFAULT_LIST_ITEMS);
    let tweets = state
        .upstream
        .tweets_and_replies(user_id, max_items)
        .collect()
        .await?;
    Ok(Json(json!({ "tweets": tweets })))
}

pub async fn get_following(
    State(state): State<AppState>,
    Path(id_or_handle): Path<String>,
    Query(params): Query<UntilParams>,
) -> ApiResult<Json<Value>> {
    let user_id = state.upstream.resolve_user_id(&id_or_handle).await?;
    let max_items = params.until.unwrap_or(DEFAULT_LIST_ITEMS);
    let profiles = state
        .upstream
        .following(user_id, max_items)
        .collect()
        .await?;
    Ok(Json(json!({ "profiles": profiles })))
}

pub async fn get_followers(
    State(state): State<AppState>,
    Path(id_or_handle): Path<String>,
    Query(params): Query<UntilParams>,
) -> ApiResult<Json<Value>> {
    let user_id = state.upstream.resolve_user_id(&id_or_handle).await?;
    let max_items = params.until.unwrap_or(DEFAULT_LIST_ITEMS);
    let profiles = state
        .upstream
        .followers(user_id, max_items)
        .collect()
        .await?;
    Ok(Json(json!({ "profiles": profiles })))
}

/// Complete tweet history. With `Accept: application/jsonl` the response
/// streams one object per line as passes complete; otherwise the whole
/// set is buffered into one JSON document.
pub async fn get_all_tweets(
    State(state): State<AppState>,
    Path(id_or_handle): Path<String>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    let screen_name = state.upstream.resolve_screen_name(&id_or_handle).await?;
    let wants_jsonl = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/jsonl"));

    let stream = state.upstream.all_tweets_ever(screen_name);
    if wants_jsonl {
        let lines = stream.map(|result| -> Result<Bytes, std::convert::Infallible> {
            let line = match result {
                Ok(item) => format!("{item}\n"),
                Err(err) => format!("{}\n", json!({ "error": err.to_string() })),
            };
            Ok(Bytes::from(line))
        });
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/jsonl")
            .body(Body::from_stream(lines))
            .map_err(|e| ApiError::internal(e, None))?;
        return Ok(response);
    }

    let mut tweets = Vec::new();
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        tweets.push(item?);
    }
    Ok(Json(json!({ "tweets": tweets })).into_response())
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub until: Option<usize>,
    pub mode: Option<String>,
}

pub async fn search_people(
    State(state): State<AppState>,
    Path(query): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let max_items = params.until.unwrap_or(DEFAULT_LIST_ITEMS);
    let profiles = state
        .upstream
        .search(query, SearchMode::People, max_items)
        .collect()
        .await?;
    Ok(Json(json!({ "profiles": profiles })))
}

pub async fn search_tweets(
    State(state): State<AppState>,
    Path(query): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let mode = match params.mode.as_deref() {
        None => SearchMode::Top,
        Some(raw) => {
            SearchMode::parse(raw).ok_or_else(|| ApiError::bad_request("invalid_search_mode", None))?
        }
    };
    let max_items = params.until.unwrap_or(DEFAULT_LIST_ITEMS);
    let tweets = state
        .upstream
        .search(query, mode, max_items)
        .collect()
        .await?;
    Ok(Json(json!({ "tweets": tweets })))
}

pub async fn get_community_members(
    State(state): State<AppState>,
    Path(community_id): Path<String>,
    Query(params): Query<UntilParams>,
) -> ApiResult<Json<Value>> {
    let max_items = params.until.unwrap_or(DEFAULT_LIST_ITEMS);
    let members = state
        .upstream
        .community_members(community_id, max_items)
        .collect()
        .await?;
    Ok(Json(Value::Array(members)))
}

// ---------------- admin: accounts ----------------

#[derive(Deserialize)]
pub struct ImportRequest {
    pub format: String,
    pub accounts: String,
}

pub async fn import_accounts(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<Json<Value>> {
    let format = ImportFormat::parse(&request.format)
        .map_err(|e| ApiError::BadRequest {
            code: "invalid_format",
            trace_id: None,
            message: Some(e.to_string()),
        })?;
    let (records, skipped) = format.parse_many(&request.accounts);
    let parsed = records.len();
    let added = state
        .store
        .add(records)
        .map_err(|e| ApiError::internal(e, None))?;
    info!(parsed, added, skipped, "imported accounts");
    Ok(Json(json!({
        "message": format!("imported {added} new accounts ({parsed} parsed, {skipped} lines skipped)"),
        "count": added,
    })))
}

pub async fn force_login(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.pool.trigger_reinitialize();
    Ok(Json(json!({ "message": "pool rotation started" })))
}

pub async fn list_accounts(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let accounts: Vec<Value> = state
        .store
        .snapshot()
        .into_iter()
        .map(|s| {
            json!({
                "username": s.credential.username,
                "email": s.credential.email,
                "tokenState": s.token_state,
                "failedLogin": s.failed_login,
                "lastUsed": s.last_used,
                "lastFailedAt": s.last_failed_at,
                "rateLimitedUntil": s.rate_limited_until,
                "assignedProxy": s.assigned_proxy,
                "hasAuthToken": s.credential.auth_token.is_some(),
                "hasTwoFactorSecret": s.credential.two_factor_secret.is_some(),
            })
        })
        .collect();
    Ok(Json(json!({
        "loggedIn": state.pool.is_logged_in(),
        "activeSessions": state.pool.active_len(),
        "accounts": accounts,
    })))
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.pool.delete(&username) {
        return Err(ApiError::NotFound {
            code: "account_not_found",
            trace_id: None,
            metadata: None,
        });
    }
    Ok(Json(json!({ "message": format!("deleted {username}") })))
}

pub async fn reset_failed_accounts(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.pool.reset_failed();
    Ok(Json(json!({ "message": "accounts reset; pool rotation started" })))
}

// ---------------- admin: issued tokens ----------------

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub name: String,
}

pub async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<IssueTokenRequest>,
) -> ApiResult<Json<Value>> {
    let token = state
        .tokens
        .issue(&request.name)
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(Json(json!({
        "id": token.id,
        "name": token.name,
        "value": token.value,
        "createdAt": token.created_at,
    })))
}

pub async fn list_tokens(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let tokens: Vec<Value> = state
        .tokens
        .list()
        .into_iter()
        .map(|t| {
            let preview: String = t.value.chars().take(6).collect();
            json!({
                "id": t.id,
                "name": t.name,
                "valuePreview": format!("{preview}…"),
                "createdAt": t.created_at,
                "lastUsed": t.last_used,
            })
        })
        .collect();
    Ok(Json(json!({ "tokens": tokens })))
}

pub async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let removed = state
        .tokens
        .revoke(&id)
        .map_err(|e| ApiError::internal(e, None))?;
    if !removed {
        return Err(ApiError::NotFound {
            code: "token_not_found",
            trace_id: None,
            metadata: None,
        });
    }
    Ok(Json(json!({ "message": "token revoked" })))
}
