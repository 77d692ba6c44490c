pub mod app_state;
pub mod authenticator;
pub mod config;
pub mod error;
pub mod guest;
pub mod handlers;
pub mod import;
pub mod jar;
pub mod login;
pub mod mail;
pub mod metrics;
pub mod paginate;
pub mod pool;
pub mod routes;
pub mod session;
pub mod store;
pub mod tokens;
pub mod totp;
pub mod transport;
pub mod txid;
pub mod upstream;

// Re-export key types for tests
pub use crate::app_state::AppState;
pub use crate::authenticator::RotatingAuthenticator;
pub use crate::config::GatewayConfig;
pub use crate::error::ScrapeError;
pub use crate::metrics::GatewayMetrics;
pub use crate::pool::AccountPool;
pub use crate::routes::build_router;
pub use crate::store::AccountStore;
pub use crate::tokens::TokenStore;
pub use crate::upstream::UpstreamClient;
