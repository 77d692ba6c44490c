use crate::jar::SessionJar;
use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;

/// Plain HTTP client bound to one session: per-call timeout, the session's
/// sticky proxy when one is assigned, no implicit retries. Retry policy
/// lives with the rotating authenticator.
#[derive(Clone)]
pub struct UpstreamTransport {
    client: Client,
    proxy: Option<String>,
}

impl UpstreamTransport {
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(uri) = proxy {
            let proxy = reqwest::Proxy::all(uri)
                .with_context(|| format!("invalid proxy uri {uri}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("failed to build upstream client")?;
        Ok(Self {
            client,
            proxy: proxy.map(str::to_string),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Issue the request and absorb any `set-cookie` response headers into
    /// the session jar before handing the response back.
    pub async fn send_with_jar(
        &self,
        request: RequestBuilder,
        jar: &SessionJar,
    ) -> reqwest::Result<Response> {
        let response = request.send().await?;
        jar.absorb(&response);
        Ok(response)
    }
}
