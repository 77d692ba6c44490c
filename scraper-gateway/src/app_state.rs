use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::pool::AccountPool;
use crate::store::AccountStore;
use crate::tokens::TokenStore;
use crate::upstream::UpstreamClient;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AccountStore>,
    pub pool: Arc<AccountPool>,
    pub upstream: Arc<UpstreamClient>,
    pub tokens: Arc<TokenStore>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: Arc<GatewayConfig>,
}
