//! Rotating authenticator: presents the warm pool as a single HTTP
//! transport. Each call draws sessions round-robin, translates upstream
//! status codes into pool feedback, and retries on another session until
//! the pool is exhausted.

use crate::error::ScrapeError;
use crate::login::first_error_message;
use crate::metrics::GatewayMetrics;
use crate::pool::AccountPool;
use crate::store::now_ms;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

const DEFAULT_RATE_LIMIT_BACKOFF_MS: i64 = 5 * 60 * 1000;
const ACCESS_DENIED_MARKER: &str = "Authorization: Denied by access control";

pub struct RotatingAuthenticator {
    pool: Arc<AccountPool>,
    metrics: Arc<GatewayMetrics>,
}

impl RotatingAuthenticator {
    pub fn new(pool: Arc<AccountPool>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { pool, metrics }
    }

    pub fn is_logged_in(&self) -> bool {
        self.pool.is_logged_in()
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    /// GET the URL through some warm session and return the JSON body.
    pub async fn fetch_json(&self, url: &str) -> Result<Value, ScrapeError> {
        let max_retries = self.pool.active_len().max(1);
        let mut tried: HashSet<String> = HashSet::new();

        while tried.len() < max_retries {
            let Some(session) = self.pool.next().await else {
                if tried.is_empty() {
                    return Err(ScrapeError::PoolEmpty);
                }
                break;
            };
            let username = session.username().to_string();
            if !tried.insert(username.clone()) {
                // Round-robin brought back a session we already tried:
                // everything usable has been consumed this call.
                break;
            }

            let mut headers = HeaderMap::new();
            session.install_headers(&mut headers);
            let started = Instant::now();
            let result = session
                .transport()
                .send_with_jar(
                    session.transport().client().get(url).headers(headers),
                    session.jar(),
                )
                .await;
            self.metrics
                .observe_upstream_latency(started.elapsed().as_secs_f64());

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    self.metrics.record_upstream_network_error();
                    warn!(username = %username, %err, url, "upstream request failed; retiring session");
                    self.pool.mark_failed(&username);
                    continue;
                }
            };

            let status = response.status();
            self.metrics.record_upstream_status(status.as_u16());

            if status == StatusCode::TOO_MANY_REQUESTS {
                let until = rate_limit_reset_ms(response.headers())
                    .unwrap_or_else(|| now_ms() + DEFAULT_RATE_LIMIT_BACKOFF_MS);
                warn!(username = %username, until, url, "session rate limited");
                self.pool.mark_rate_limited(&username, Some(until));
                continue;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!(username = %username, status = status.as_u16(), url, "session rejected; retiring");
                self.pool.mark_failed(&username);
                continue;
            }
            if !status.is_success() {
                warn!(username = %username, status = status.as_u16(), url, "unexpected upstream status");
                continue;
            }

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    return Err(ScrapeError::Parse(format!(
                        "upstream body was not JSON: {err}"
                    )));
                }
            };
            // The upstream occasionally smuggles an account-level denial
            // into a 200 body.
            if let Some(message) = first_error_message(&body) {
                if message.contains(ACCESS_DENIED_MARKER) {
                    warn!(username = %username, url, "access-control denial in response body; retiring session");
                    self.pool.mark_failed(&username);
                    continue;
                }
            }
            return Ok(body);
        }

        Err(ScrapeError::ExhaustedAccounts {
            url: url.to_string(),
            attempts: tried.len(),
        })
    }
}

fn rate_limit_reset_ms(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .map(|epoch_secs| epoch_secs * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::jar::SessionJar;
    use crate::mail::UnconfiguredMailFetcher;
    use crate::session::ActiveSession;
    use crate::store::{AccountCredential, AccountStore, TokenState};
    use crate::transport::UpstreamTransport;
    use crate::txid::NoTransactionId;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn credential(username: &str) -> AccountCredential {
        AccountCredential {
            username: username.into(),
            password: "pw".into(),
            email: String::new(),
            email_password: String::new(),
            auth_token: None,
            two_factor_secret: None,
        }
    }

    fn harness(dir: &std::path::Path, usernames: &[&str]) -> (RotatingAuthenticator, Arc<AccountStore>) {
        let store = Arc::new(AccountStore::open(dir.join("accounts.json")).unwrap());
        store
            .add(usernames.iter().map(|u| credential(u)).collect())
            .unwrap();
        let config = Arc::new(GatewayConfig {
            accounts_state_path: dir.join("accounts.json").display().to_string(),
            token_db_path: dir.join("tokens.json").display().to_string(),
            admin_password: None,
            upstream_base_url: "http://127.0.0.1:1".into(),
            pool_size: usernames.len().max(1),
            proxy_uri: None,
            proxy_list: Vec::new(),
            upstream_timeout: Duration::from_secs(2),
            guest_token_timeout: Duration::from_secs(1),
            request_idle_timeout: Duration::from_secs(255),
        });
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let pool = AccountPool::new(
            store.clone(),
            config,
            metrics.clone(),
            Arc::new(UnconfiguredMailFetcher),
            Arc::new(NoTransactionId),
        );
        for username in usernames {
            // Distinct cookies let a mock upstream tell sessions apart.
            let jar = SessionJar::new("127.0.0.1");
            jar.set("auth_token", username);
            pool.inject_session(ActiveSession::new(
                *username,
                jar,
                UpstreamTransport::new(Duration::from_secs(2), None).unwrap(),
            ));
        }
        (RotatingAuthenticator::new(pool, metrics), store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rate_limited_session_is_skipped_and_request_retried() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let (auth, store) = harness(dir.path(), &["alice", "bob"]);

        let reset_epoch = (now_ms() / 1000) + 60;
        let limited = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/data")
                    .header("cookie", "auth_token=alice");
                then.status(429)
                    .header("x-rate-limit-reset", reset_epoch.to_string());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/data")
                    .header("cookie", "auth_token=bob");
                then.status(200).json_body(serde_json::json!({"ok": true}));
            })
            .await;

        // alice is dispatched first, absorbs the 429, and the call retries
        // on bob transparently.
        let body = auth.fetch_json(&server.url("/data")).await.unwrap();
        assert_eq!(body["ok"], true);
        limited.assert_hits_async(1).await;

        let alice = store.get("alice").unwrap();
        assert_eq!(alice.rate_limited_until, Some(reset_epoch * 1000));
        assert!(!alice.failed_login);
        assert!(!store.get("bob").unwrap().failed_login);

        // The rate-limited session stays warm but is skipped while the
        // window is open.
        let again = auth.fetch_json(&server.url("/data")).await.unwrap();
        assert_eq!(again["ok"], true);
        limited.assert_hits_async(1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthorized_marks_failed_then_exhausts() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let (auth, store) = harness(dir.path(), &["alice"]);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/data");
                then.status(401);
            })
            .await;

        let err = auth.fetch_json(&server.url("/data")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::ExhaustedAccounts { attempts: 1, .. }));
        let state = store.get("alice").unwrap();
        assert!(state.failed_login);
        assert_eq!(state.token_state, TokenState::Failed);

        // The pool is now empty; the next call reports that directly.
        let err = auth.fetch_json(&server.url("/data")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::PoolEmpty | ScrapeError::ExhaustedAccounts { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn distinct_sessions_per_call_bounded_by_pool_size() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let (auth, _store) = harness(dir.path(), &["alice", "bob", "carol"]);

        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/data");
                then.status(500);
            })
            .await;

        let err = auth.fetch_json(&server.url("/data")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::ExhaustedAccounts { attempts: 3, .. }));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn body_level_access_denial_is_treated_as_forbidden() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let (auth, store) = harness(dir.path(), &["alice"]);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/data");
                then.status(200).json_body(serde_json::json!({
                    "errors": [{"message": "Authorization: Denied by access control"}]
                }));
            })
            .await;

        let err = auth.fetch_json(&server.url("/data")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::ExhaustedAccounts { .. }));
        assert!(store.get("alice").unwrap().failed_login);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_error_bodies_pass_through() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let (auth, store) = harness(dir.path(), &["alice"]);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/data");
                then.status(200).json_body(serde_json::json!({
                    "errors": [{"message": "User not found."}]
                }));
            })
            .await;

        let body = auth.fetch_json(&server.url("/data")).await.unwrap();
        assert_eq!(body["errors"][0]["message"], "User not found.");
        assert!(!store.get("alice").unwrap().failed_login);
    }

    #[test]
    fn rate_limit_reset_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-reset", "1700000000".parse().unwrap());
        assert_eq!(rate_limit_reset_ms(&headers), Some(1_700_000_000_000));
        assert_eq!(rate_limit_reset_ms(&HeaderMap::new()), None);
    }
}
