//! Shared harness for end-to-end tests: a gateway wired against an
//! httpmock upstream, with tempdir-backed stores and a pre-issued
//! downstream bearer token.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use scraper_gateway::app_state::AppState;
use scraper_gateway::authenticator::RotatingAuthenticator;
use scraper_gateway::config::GatewayConfig;
use scraper_gateway::guest::GuestAuth;
use scraper_gateway::mail::UnconfiguredMailFetcher;
use scraper_gateway::metrics::GatewayMetrics;
use scraper_gateway::pool::AccountPool;
use scraper_gateway::routes::build_router;
use scraper_gateway::store::{AccountCredential, AccountStore};
use scraper_gateway::tokens::TokenStore;
use scraper_gateway::transport::UpstreamTransport;
use scraper_gateway::txid::NoTransactionId;
use scraper_gateway::upstream::UpstreamClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const ADMIN_PASSWORD: &str = "admin-pw";

pub struct Harness {
    // Holds the tempdir alive for the duration of the test.
    _dir: tempfile::TempDir,
    pub state: AppState,
    pub bearer: String,
}

pub fn gateway(upstream_base: &str, pool_size: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let accounts_path = dir.path().join("accounts.json");
    let tokens_path = dir.path().join("tokens.json");
    let config = Arc::new(GatewayConfig {
        accounts_state_path: accounts_path.display().to_string(),
        token_db_path: tokens_path.display().to_string(),
        admin_password: Some(ADMIN_PASSWORD.to_string()),
        upstream_base_url: upstream_base.trim_end_matches('/').to_string(),
        pool_size,
        proxy_uri: None,
        proxy_list: Vec::new(),
        upstream_timeout: Duration::from_secs(5),
        guest_token_timeout: Duration::from_secs(5),
        request_idle_timeout: Duration::from_secs(255),
    });

    let store = Arc::new(AccountStore::open(&accounts_path).unwrap());
    let tokens = Arc::new(TokenStore::open(&tokens_path).unwrap());
    let metrics = Arc::new(GatewayMetrics::new().unwrap());
    let pool = AccountPool::new(
        store.clone(),
        config.clone(),
        metrics.clone(),
        Arc::new(UnconfiguredMailFetcher),
        Arc::new(NoTransactionId),
    );
    let authenticator = Arc::new(RotatingAuthenticator::new(pool.clone(), metrics.clone()));
    let guest_transport = UpstreamTransport::new(config.upstream_timeout, None).unwrap();
    let guest = GuestAuth::new(config.upstream_base_url.clone(), config.guest_token_timeout);
    let upstream = Arc::new(UpstreamClient::new(
        authenticator,
        guest,
        guest_transport,
        config.upstream_base_url.clone(),
        metrics.clone(),
    ));

    let bearer = tokens.issue("test-client").unwrap().value;

    Harness {
        _dir: dir,
        state: AppState {
            store,
            pool,
            upstream,
            tokens,
            metrics,
            config,
        },
        bearer,
    }
}

impl Harness {
    pub fn credential(username: &str, auth_token: Option<&str>) -> AccountCredential {
        AccountCredential {
            username: username.to_string(),
            password: "pw".to_string(),
            email: format!("{username}@example.com"),
            email_password: "ep".to_string(),
            auth_token: auth_token.map(str::to_string),
            two_factor_secret: None,
        }
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        bearer: Option<&str>,
        admin: bool,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if admin {
            builder = builder.header("X-Admin-Password", ADMIN_PASSWORD);
        }
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = build_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.request("GET", path, Some(&self.bearer), false, None).await
    }
}

/// Script the seeded-cookie login path: the home page hands out a csrf
/// cookie and the authenticated probe succeeds.
pub fn mock_token_login(server: &MockServer) {
    server.mock(|when, then| {
        when.method(GET).path("/home");
        then.status(200)
            .header("set-cookie", "ct0=csrf-seed; Path=/")
            .body("<html></html>");
    });
    server.mock(|when, then| {
        when.method(GET).path_contains("/Viewer");
        then.status(200).json_body(json!({"data": {"viewer": {}}}));
    });
}

pub fn mock_guest_activation(server: &MockServer) {
    server.mock(|when, then| {
        when.method(POST).path("/1.1/guest/activate.json");
        then.status(200).json_body(json!({"guest_token": "guest-1"}));
    });
}

/// GraphQL timeline body with one `TimelineAddEntries` instruction.
pub fn timeline_body(ids: &[u64], cursor: Option<&str>) -> Value {
    let mut entries: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "entryId": format!("tweet-{id}"),
                "content": {
                    "itemContent": {
                        "tweet_results": {
                            "result": { "rest_id": id.to_string(), "legacy": {"full_text": format!("tweet {id}")} }
                        }
                    }
                }
            })
        })
        .collect();
    if let Some(cursor) = cursor {
        entries.push(json!({
            "entryId": "cursor-bottom-0",
            "content": { "cursorType": "Bottom", "value": cursor }
        }));
    }
    json!({
        "data": { "user": { "result": { "timeline_v2": { "timeline": {
            "instructions": [ { "type": "TimelineAddEntries", "entries": entries } ]
        }}}}}
    })
}
