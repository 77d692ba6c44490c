use crate::guest::BEARER_TOKEN;
use crate::jar::SessionJar;
use crate::transport::UpstreamTransport;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};

/// A live, logged-in upstream identity: cookie jar plus the transport
/// carrying the account's sticky proxy. In-memory only; the durable
/// counterpart is the `AccountState` row keyed by the same username.
pub struct ActiveSession {
    username: String,
    jar: SessionJar,
    transport: UpstreamTransport,
}

impl ActiveSession {
    pub fn new(username: impl Into<String>, jar: SessionJar, transport: UpstreamTransport) -> Self {
        Self {
            username: username.into(),
            jar,
            transport,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn jar(&self) -> &SessionJar {
        &self.jar
    }

    pub fn transport(&self) -> &UpstreamTransport {
        &self.transport
    }

    /// The upstream session cookie, for persisting back onto the account
    /// record after a successful login.
    pub fn auth_token(&self) -> Option<String> {
        self.jar.get("auth_token")
    }

    pub fn install_headers(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {BEARER_TOKEN}")) {
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(cookie_header) = self.jar.header_value() {
            if let Ok(value) = HeaderValue::from_str(&cookie_header) {
                headers.insert(COOKIE, value);
            }
        }
        if let Some(csrf) = self.jar.get("ct0") {
            if let Ok(value) = HeaderValue::from_str(&csrf) {
                headers.insert("x-csrf-token", value);
            }
        }
        headers.insert("x-twitter-active-user", HeaderValue::from_static("yes"));
        headers.insert("x-twitter-client-language", HeaderValue::from_static("en"));
        headers.insert("x-twitter-auth-type", HeaderValue::from_static("OAuth2Session"));
    }
}
