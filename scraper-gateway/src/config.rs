use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub accounts_state_path: String,
    pub token_db_path: String,
    pub admin_password: Option<String>,
    pub upstream_base_url: String,
    pub pool_size: usize,
    pub proxy_uri: Option<String>,
    pub proxy_list: Vec<String>,
    pub upstream_timeout: Duration,
    pub guest_token_timeout: Duration,
    pub request_idle_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let accounts_state_path =
            env::var("ACCOUNTS_STATE_PATH").context("ACCOUNTS_STATE_PATH must be set")?;
        let token_db_path = env::var("TOKEN_DB_PATH").context("TOKEN_DB_PATH must be set")?;
        let admin_password = env::var("ADMIN_PASSWORD").ok().filter(|v| !v.is_empty());
        let upstream_base_url = env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://api.twitter.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let pool_size = env::var("GATEWAY_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(5);
        let proxy_uri = env::var("PROXY_URI").ok().filter(|v| !v.is_empty());
        let proxy_list = env::var("PROXY_LIST")
            .map(|raw| parse_proxy_list(&raw))
            .unwrap_or_default();
        let upstream_timeout = env::var("UPSTREAM_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60);
        let guest_token_timeout = env::var("GUEST_TOKEN_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(10);
        let request_idle_timeout = env::var("REQUEST_IDLE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(255);

        Ok(Self {
            accounts_state_path,
            token_db_path,
            admin_password,
            upstream_base_url,
            pool_size: pool_size.max(1),
            proxy_uri,
            proxy_list,
            upstream_timeout: Duration::from_secs(upstream_timeout.max(1)),
            guest_token_timeout: Duration::from_secs(guest_token_timeout.max(1)),
            request_idle_timeout: Duration::from_secs(request_idle_timeout.max(1)),
        })
    }
}

/// Newline-separated proxy URIs; blank lines and `#` comments are skipped.
pub fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
