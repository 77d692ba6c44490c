use anyhow::{bail, Result};
use async_trait::async_trait;

/// Seam for the IMAP helper that pulls upstream confirmation codes out of
/// the account's mailbox. The helper itself lives outside this service;
/// the login flow only needs this call.
#[async_trait]
pub trait MailCodeFetcher: Send + Sync {
    async fn fetch_latest_code(&self, email: &str, email_password: &str) -> Result<String>;
}

/// Default implementation used when no mail helper is wired up: challenges
/// that need a mailed code fail the login instead of hanging.
pub struct UnconfiguredMailFetcher;

#[async_trait]
impl MailCodeFetcher for UnconfiguredMailFetcher {
    async fn fetch_latest_code(&self, email: &str, _email_password: &str) -> Result<String> {
        bail!("no mail code fetcher configured; cannot read confirmation code for {email}");
    }
}
