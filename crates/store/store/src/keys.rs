use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warren_core::{ApiKey, KeyId, OrgId};

use crate::error::StoreError;

/// Typed operations over API keys.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Look up a key by the SHA-256 hex digest of its raw form.
    ///
    /// Expiry and scope are the caller's concern; revoked keys return
    /// `None`.
    async fn validate(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;

    async fn create(&self, key: ApiKey) -> Result<(), StoreError>;

    async fn list_by_org(&self, org: OrgId) -> Result<Vec<ApiKey>, StoreError>;

    /// Revoke a key. Returns `true` if it existed.
    async fn revoke(&self, id: KeyId) -> Result<bool, StoreError>;

    /// Stamp `last_used_at` after a successful validation.
    async fn touch_last_used(&self, id: KeyId, at: DateTime<Utc>) -> Result<(), StoreError>;
}
