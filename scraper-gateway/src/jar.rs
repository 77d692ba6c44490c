//! Per-session cookie jar. The upstream keys its auth on a handful of
//! cookies (`auth_token`, `ct0`); everything else is ballast that must be
//! scrubbed before a fresh login flow.

use cookie::{Cookie, CookieJar};
use std::sync::Mutex;

/// Cookies the upstream plants during browsing that poison a new login
/// flow; removed before the flow is initiated.
pub const TRANSIENT_COOKIES: [&str; 15] = [
    "twitter_ads_id",
    "ads_prefs",
    "_twitter_sess",
    "zipbox_forms_auth_token",
    "lang",
    "bouncer_reset_cookie",
    "twid",
    "twitter_ads_idb",
    "email_uid",
    "external_referer",
    "ct0",
    "aa_u",
    "att",
    "kdt",
    "remember_checked_on",
];

pub struct SessionJar {
    domain: String,
    inner: Mutex<CookieJar>,
}

impl SessionJar {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            inner: Mutex::new(CookieJar::new()),
        }
    }

    pub fn absorb(&self, response: &reqwest::Response) {
        let mut jar = self.inner.lock().expect("cookie jar lock poisoned");
        for header in response.headers().get_all(reqwest::header::SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            if let Ok(parsed) = Cookie::parse(raw.to_string()) {
                jar.add(parsed.into_owned());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("cookie jar lock poisoned")
            .get(name)
            .map(|c| c.value().to_string())
    }

    pub fn set(&self, name: &str, value: &str) {
        let mut cookie = Cookie::new(name.to_string(), value.to_string());
        cookie.set_path("/");
        cookie.set_domain(self.domain.clone());
        cookie.set_secure(true);
        cookie.set_http_only(true);
        self.inner
            .lock()
            .expect("cookie jar lock poisoned")
            .add(cookie);
    }

    pub fn remove(&self, name: &str) {
        self.inner
            .lock()
            .expect("cookie jar lock poisoned")
            .remove(Cookie::from(name.to_string()));
    }

    pub fn clear_transient(&self) {
        let mut jar = self.inner.lock().expect("cookie jar lock poisoned");
        for name in TRANSIENT_COOKIES {
            jar.remove(Cookie::from(name));
        }
    }

    /// `name=value; ...` for a Cookie request header; None when empty.
    pub fn header_value(&self) -> Option<String> {
        let jar = self.inner.lock().expect("cookie jar lock poisoned");
        let serialized = jar
            .iter()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect::<Vec<_>>()
            .join("; ");
        if serialized.is_empty() {
            None
        } else {
            Some(serialized)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("cookie jar lock poisoned")
            .iter()
            .next()
            .is_none()
    }
}
