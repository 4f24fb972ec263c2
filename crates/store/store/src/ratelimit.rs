use async_trait::async_trait;

use warren_core::RateLimitState;

use crate::error::StoreError;

/// Persistence for rate-limit counters.
///
/// The hot state lives in memory; this store is the write-behind layer
/// that lets block windows survive a process restart.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, StoreError>;

    async fn put(&self, key: &str, state: &RateLimitState) -> Result<(), StoreError>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Every persisted row, for startup repopulation of the hot map.
    async fn load_all(&self) -> Result<Vec<(String, RateLimitState)>, StoreError>;
}
