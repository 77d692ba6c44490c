use async_trait::async_trait;

/// The upstream sometimes requires an `X-Client-Transaction-Id` header on
/// login requests, derived from anti-bot data embedded in its pages. The
/// generation is opaque and delegated; when no provider is wired up the
/// flow proceeds without the header.
#[async_trait]
pub trait TransactionIdProvider: Send + Sync {
    async fn transaction_id(&self, method: &str, path: &str) -> Option<String>;
}

pub struct NoTransactionId;

#[async_trait]
impl TransactionIdProvider for NoTransactionId {
    async fn transaction_id(&self, _method: &str, _path: &str) -> Option<String> {
        None
    }
}
