use async_trait::async_trait;

use warren_core::AuthSession;

use crate::error::StoreError;

/// Typed operations over browser auth sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: AuthSession) -> Result<(), StoreError>;

    /// Look up a live session. Expired rows are filtered, not returned.
    async fn validate(&self, id: &str) -> Result<Option<AuthSession>, StoreError>;

    /// Destroy a session (logout). Returns `true` if it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Remove expired rows. Returns the number purged.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
