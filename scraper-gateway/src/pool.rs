//! Warm session pool. Maintains up to `pool_size` logged-in sessions drawn
//! from the credential store, dispatches them round-robin, and digests the
//! authenticator's feedback (rate limited, failed) into account state.
//!
//! Locking: `inner` guards the active list and round-robin index and is
//! held only across O(P) bookkeeping. Logins, HTTP calls, and store
//! persistence all happen outside it.

use crate::config::GatewayConfig;
use crate::guest::GuestAuth;
use crate::jar::SessionJar;
use crate::login::LoginFlow;
use crate::mail::MailCodeFetcher;
use crate::metrics::GatewayMetrics;
use crate::session::ActiveSession;
use crate::store::{now_ms, AccountState, AccountStore, TokenState};
use crate::transport::UpstreamTransport;
use crate::txid::TransactionIdProvider;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

const ARKOSE_BACKOFF: Duration = Duration::from_secs(5);

struct PoolInner {
    active: Vec<Arc<ActiveSession>>,
    cursor: usize,
}

pub struct AccountPool {
    store: Arc<AccountStore>,
    config: Arc<GatewayConfig>,
    metrics: Arc<GatewayMetrics>,
    mail: Arc<dyn MailCodeFetcher>,
    txid: Arc<dyn TransactionIdProvider>,
    inner: Mutex<PoolInner>,
    // Serializes warm-ups; doubles as the readiness gate for dispatch.
    init_lock: AsyncMutex<()>,
    initialized: AtomicBool,
    replenish_queued: AtomicBool,
}

impl AccountPool {
    pub fn new(
        store: Arc<AccountStore>,
        config: Arc<GatewayConfig>,
        metrics: Arc<GatewayMetrics>,
        mail: Arc<dyn MailCodeFetcher>,
        txid: Arc<dyn TransactionIdProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            metrics,
            mail,
            txid,
            inner: Mutex::new(PoolInner {
                active: Vec::new(),
                cursor: 0,
            }),
            init_lock: AsyncMutex::new(()),
            initialized: AtomicBool::new(false),
            replenish_queued: AtomicBool::new(false),
        })
    }

    /// Idempotent, await-coalesced warm-up. Late callers block on the same
    /// in-flight initialization instead of starting another.
    pub async fn ensure_initialized(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.warm_up().await;
        self.initialized.store(true, Ordering::Release);
    }

    /// Drop every warm session and rebuild the pool from scratch.
    pub async fn reinitialize(&self) {
        let _guard = self.init_lock.lock().await;
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.active.clear();
            inner.cursor = 0;
        }
        self.metrics.set_active_sessions(0);
        self.warm_up().await;
        self.initialized.store(true, Ordering::Release);
    }

    async fn warm_up(&self) {
        let target = self.config.pool_size;
        let active_names: Vec<String> = {
            let inner = self.inner.lock().expect("pool lock poisoned");
            inner
                .active
                .iter()
                .map(|s| s.username().to_string())
                .collect()
        };
        if active_names.len() >= target {
            return;
        }

        let mut candidates: Vec<AccountState> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|s| !s.failed_login && !active_names.iter().any(|n| n == s.username()))
            .collect();
        // Prefer accounts that have never been dispatched.
        candidates.sort_by_key(|s| (s.last_used.is_some(), s.last_used));

        info!(
            candidates = candidates.len(),
            active = active_names.len(),
            target,
            "warming account pool"
        );

        for candidate in candidates {
            if self.active_len() >= target {
                break;
            }
            match self.warm_candidate(&candidate).await {
                Ok(session) => {
                    let username = candidate.username().to_string();
                    let auth_token = session.auth_token();
                    if let Err(err) = self.store.update(&username, |state| {
                        state.token_state = TokenState::Working;
                        state.failed_login = false;
                        state.last_used = Some(now_ms());
                        if auth_token.is_some() {
                            state.credential.auth_token = auth_token.clone();
                        }
                    }) {
                        warn!(username = %username, ?err, "failed to persist login success");
                    }
                    let count = {
                        let mut inner = self.inner.lock().expect("pool lock poisoned");
                        inner.active.push(Arc::new(session));
                        inner.active.len()
                    };
                    self.metrics.set_active_sessions(count);
                    self.metrics.record_warmup("success");
                    info!(username = %username, active = count, "session warmed");
                }
                Err(err) => {
                    let username = candidate.username().to_string();
                    warn!(username = %username, %err, "login failed during warm-up");
                    if let Err(store_err) = self.store.update(&username, |state| {
                        state.failed_login = true;
                        state.token_state = TokenState::Failed;
                        state.last_failed_at = Some(now_ms());
                    }) {
                        warn!(username = %username, ?store_err, "failed to persist login failure");
                    }
                    self.metrics.record_warmup("failure");
                    if err.is_arkose() {
                        tokio::time::sleep(ARKOSE_BACKOFF).await;
                    }
                }
            }
        }

        if self.active_len() == 0 {
            warn!("account pool is empty after warm-up");
        }
    }

    async fn warm_candidate(
        &self,
        candidate: &AccountState,
    ) -> Result<ActiveSession, crate::login::LoginError> {
        let username = candidate.username().to_string();
        let proxy = match candidate.assigned_proxy.clone() {
            Some(proxy) => Some(proxy),
            None => {
                let chosen = self.choose_proxy();
                if let Some(ref proxy) = chosen {
                    let proxy = proxy.clone();
                    let _ = self.store.update(&username, move |state| {
                        state.assigned_proxy = Some(proxy);
                    });
                }
                chosen
            }
        };

        let jar = SessionJar::new(upstream_domain(&self.config.upstream_base_url));
        let transport = UpstreamTransport::new(self.config.upstream_timeout, proxy.as_deref())
            .map_err(|e| crate::login::LoginError::Fatal(e.to_string()))?;
        let guest = GuestAuth::new(
            self.config.upstream_base_url.clone(),
            self.config.guest_token_timeout,
        );

        {
            let flow = LoginFlow {
                base_url: &self.config.upstream_base_url,
                transport: &transport,
                jar: &jar,
                guest: &guest,
                mail: self.mail.as_ref(),
                txid: self.txid.as_ref(),
            };

            let mut token_ok = false;
            if let Some(token) = candidate.credential.auth_token.as_deref() {
                match flow.login_with_token(token).await {
                    Ok(()) => token_ok = true,
                    Err(err) => {
                        warn!(username = %username, %err, "seeded session cookie rejected; falling back to interactive login");
                        let _ = self.store.update(&username, |state| {
                            state.credential.auth_token = None;
                        });
                        jar.remove("auth_token");
                    }
                }
            }
            if !token_ok {
                flow.run(&candidate.credential).await?;
            }
        }

        Ok(ActiveSession::new(username, jar, transport))
    }

    fn choose_proxy(&self) -> Option<String> {
        if !self.config.proxy_list.is_empty() {
            return self
                .config
                .proxy_list
                .choose(&mut rand::thread_rng())
                .cloned();
        }
        self.config.proxy_uri.clone()
    }

    /// Round-robin dispatch. Skips sessions sitting out a rate-limit window
    /// (clearing the field once the window has passed) and returns `None`
    /// only after one full fruitless revolution.
    pub async fn next(&self) -> Option<Arc<ActiveSession>> {
        self.ensure_initialized().await;

        let limits: HashMap<String, Option<i64>> = self
            .store
            .snapshot()
            .into_iter()
            .map(|s| (s.username().to_string(), s.rate_limited_until))
            .collect();
        let now = now_ms();

        let mut expired: Vec<String> = Vec::new();
        let chosen = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let len = inner.active.len();
            let mut chosen = None;
            for i in 0..len {
                let idx = (inner.cursor + i) % len;
                let session = &inner.active[idx];
                match limits.get(session.username()).copied().flatten() {
                    Some(until) if until > now => {
                        self.metrics.record_rate_limit_skip();
                        continue;
                    }
                    Some(_) => expired.push(session.username().to_string()),
                    None => {}
                }
                let cloned = session.clone();
                inner.cursor = (idx + 1) % len;
                chosen = Some(cloned);
                break;
            }
            chosen
        };

        for username in expired {
            let _ = self.store.update(&username, |state| {
                state.rate_limited_until = None;
            });
        }
        if let Some(session) = chosen.as_ref() {
            let _ = self.store.update(session.username(), |state| {
                state.last_used = Some(now);
            });
        }
        chosen
    }

    pub fn active_len(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").active.len()
    }

    pub fn is_logged_in(&self) -> bool {
        self.active_len() >= 1
    }

    /// Rate limiting sidelines the session but keeps it warm; `until` in
    /// epoch ms, `None` clears the window.
    pub fn mark_rate_limited(&self, username: &str, until: Option<i64>) {
        if let Err(err) = self.store.update(username, |state| {
            state.rate_limited_until = until;
        }) {
            warn!(username = %username, ?err, "failed to persist rate limit window");
        }
    }

    /// Auth failure: retire the session, disqualify the account until an
    /// operator reset, and replenish in the background.
    pub fn mark_failed(self: &Arc<Self>, username: &str) {
        if let Err(err) = self.store.update(username, |state| {
            state.failed_login = true;
            state.token_state = TokenState::Failed;
            state.last_failed_at = Some(now_ms());
        }) {
            warn!(username = %username, ?err, "failed to persist account failure");
        }
        self.remove_active(username);
        self.metrics.record_account_retired();
        self.spawn_replenish();
    }

    pub fn delete(self: &Arc<Self>, username: &str) -> bool {
        let removed = self.store.delete(username).unwrap_or(false);
        self.remove_active(username);
        self.spawn_replenish();
        removed
    }

    /// Operator reset: every account becomes a login candidate again, and
    /// proxies are redealt when a proxy list is configured. The rebuild
    /// itself runs in the background.
    pub fn reset_failed(self: &Arc<Self>) {
        let has_list = !self.config.proxy_list.is_empty();
        let result = self.store.update_all(|state| {
            state.failed_login = false;
            state.token_state = TokenState::Unknown;
            state.rate_limited_until = None;
            state.last_failed_at = None;
            if has_list {
                state.assigned_proxy = None;
            }
        });
        if let Err(err) = result {
            warn!(?err, "failed to persist account reset");
        }
        self.trigger_reinitialize();
    }

    /// Fire-and-forget full pool rotation.
    pub fn trigger_reinitialize(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.reinitialize().await;
        });
    }

    fn remove_active(&self, username: &str) {
        let count = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.active.retain(|s| s.username() != username);
            if !inner.active.is_empty() {
                inner.cursor %= inner.active.len();
            } else {
                inner.cursor = 0;
            }
            inner.active.len()
        };
        self.metrics.set_active_sessions(count);
    }

    /// Background replenishment; concurrent requests coalesce into one
    /// queued pass behind any in-flight warm-up.
    fn spawn_replenish(self: &Arc<Self>) {
        if self.replenish_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let _guard = pool.init_lock.lock().await;
            pool.replenish_queued.store(false, Ordering::SeqCst);
            pool.warm_up().await;
        });
    }

    /// Test hook: hand the pool a pre-built session without a login flow.
    #[cfg(test)]
    pub(crate) fn inject_session(&self, session: ActiveSession) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.active.push(Arc::new(session));
        self.initialized.store(true, Ordering::Release);
    }
}

fn upstream_domain(base_url: &str) -> String {
    base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(['/', ':'])
        .next()
        .unwrap_or("twitter.com")
        .to_string()
}
