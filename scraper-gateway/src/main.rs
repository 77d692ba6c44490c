use anyhow::Context;
use axum::http::{header, HeaderName, Method};
use scraper_gateway::app_state::AppState;
use scraper_gateway::authenticator::RotatingAuthenticator;
use scraper_gateway::config::GatewayConfig;
use scraper_gateway::guest::GuestAuth;
use scraper_gateway::mail::UnconfiguredMailFetcher;
use scraper_gateway::metrics::GatewayMetrics;
use scraper_gateway::pool::AccountPool;
use scraper_gateway::routes::build_router;
use scraper_gateway::store::AccountStore;
use scraper_gateway::tokens::TokenStore;
use scraper_gateway::transport::UpstreamTransport;
use scraper_gateway::txid::NoTransactionId;
use scraper_gateway::upstream::UpstreamClient;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    if config.admin_password.is_none() {
        warn!("ADMIN_PASSWORD not set; admin endpoints are disabled");
    }

    let store = Arc::new(
        AccountStore::open(&config.accounts_state_path).context("failed to open account store")?,
    );
    let tokens =
        Arc::new(TokenStore::open(&config.token_db_path).context("failed to open token db")?);
    info!(
        accounts = store.snapshot().len(),
        tokens = tokens.list().len(),
        "stores loaded"
    );

    let metrics = Arc::new(GatewayMetrics::new()?);
    let pool = AccountPool::new(
        store.clone(),
        config.clone(),
        metrics.clone(),
        Arc::new(UnconfiguredMailFetcher),
        Arc::new(NoTransactionId),
    );
    let authenticator = Arc::new(RotatingAuthenticator::new(pool.clone(), metrics.clone()));

    let guest_transport = UpstreamTransport::new(config.upstream_timeout, None)
        .context("failed to build guest transport")?;
    let guest = GuestAuth::new(config.upstream_base_url.clone(), config.guest_token_timeout);
    let upstream = Arc::new(UpstreamClient::new(
        authenticator,
        guest,
        guest_transport,
        config.upstream_base_url.clone(),
        metrics.clone(),
    ));

    // Warm the pool eagerly; the first dispatch awaits the same
    // initialization instead of racing it.
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.ensure_initialized().await;
        });
    }

    let state = AppState {
        store,
        pool,
        upstream,
        tokens,
        metrics,
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-admin-password"),
        ]);

    let app = build_router(state)
        .layer(TimeoutLayer::new(config.request_idle_timeout))
        .layer(cors);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, upstream = %config.upstream_base_url, "starting scraper-gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
