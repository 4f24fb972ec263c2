use async_trait::async_trait;

use warren_core::{Account, AccountId};

use crate::error::StoreError;

/// Typed operations over accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn get_by_username(&self, username: &str) -> Result<Option<Account>, StoreError>;

    /// Create an account. Duplicate usernames are a [`StoreError::Conflict`].
    async fn create(&self, account: Account) -> Result<(), StoreError>;

    /// Replace an existing account row.
    async fn update(&self, account: Account) -> Result<(), StoreError>;

    /// Soft-deactivate: the row survives but token validation fails.
    async fn deactivate(&self, id: AccountId) -> Result<(), StoreError>;

    /// Look up an **active** account by the SHA-256 hex digest of its raw
    /// token. Inactive accounts return `None`.
    async fn validate_token(&self, token_hash: &str) -> Result<Option<Account>, StoreError>;
}
