use crate::jar::SessionJar;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// The upstream's well-known public bearer constant, shared by every web
/// client. Not a secret.
pub const BEARER_TOKEN: &str = "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA";

const GUEST_TOKEN_TTL_HOURS: i64 = 3;

#[derive(Debug, Clone)]
pub struct GuestToken {
    pub value: String,
    pub acquired_at: DateTime<Utc>,
}

impl GuestToken {
    fn expired(&self) -> bool {
        Utc::now() - self.acquired_at > ChronoDuration::hours(GUEST_TOKEN_TTL_HOURS)
    }
}

/// Anonymous credential used for the login flow and unauthenticated reads.
/// Refreshed lazily on next use once expired.
pub struct GuestAuth {
    base_url: String,
    timeout: Duration,
    token: Mutex<Option<GuestToken>>,
}

impl GuestAuth {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            token: Mutex::new(None),
        }
    }

    pub async fn token(&self, client: &Client) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(current) = guard.as_ref() {
            if !current.expired() {
                return Ok(current.value.clone());
            }
        }
        let refreshed = self.activate(client).await?;
        let value = refreshed.value.clone();
        *guard = Some(refreshed);
        Ok(value)
    }

    /// Drop the current token so the next use acquires a fresh one; the
    /// login flow always starts from a new guest identity.
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }

    async fn activate(&self, client: &Client) -> Result<GuestToken> {
        let url = format!("{}/1.1/guest/activate.json", self.base_url);
        let request = client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {BEARER_TOKEN}"))
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| anyhow!("guest token activation timed out"))?
            .context("guest token activation failed")?;
        let body: serde_json::Value = response
            .json()
            .await
            .context("guest token activation returned a non-JSON body")?;
        let value = body
            .get("guest_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("guest token missing from activation response"))?
            .to_string();
        debug!("acquired fresh guest token");
        Ok(GuestToken {
            value,
            acquired_at: Utc::now(),
        })
    }
}

/// Minimum header set for guest-level calls: bearer, guest token, cookies,
/// and the csrf token once a `ct0` cookie exists.
pub fn install_guest_headers(headers: &mut HeaderMap, guest_token: &str, jar: &SessionJar) {
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {BEARER_TOKEN}")) {
        headers.insert(AUTHORIZATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(guest_token) {
        headers.insert("x-guest-token", value);
    }
    if let Some(cookie_header) = jar.header_value() {
        if let Ok(value) = HeaderValue::from_str(&cookie_header) {
            headers.insert(COOKIE, value);
        }
    }
    if let Some(csrf) = jar.get("ct0") {
        if let Ok(value) = HeaderValue::from_str(&csrf) {
            headers.insert("x-csrf-token", value);
        }
    }
}
