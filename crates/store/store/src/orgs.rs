use async_trait::async_trait;

use warren_core::{OrgId, Organization};

use crate::error::StoreError;

/// Typed operations over organizations.
#[async_trait]
pub trait OrgStore: Send + Sync {
    async fn get(&self, id: OrgId) -> Result<Option<Organization>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Organization>, StoreError>;

    /// Create an organization. Duplicate names are a [`StoreError::Conflict`].
    async fn create(&self, org: Organization) -> Result<(), StoreError>;

    async fn update(&self, org: Organization) -> Result<(), StoreError>;

    /// Delete an organization. Implementations must refuse with
    /// [`StoreError::Conflict`] while the organization still owns
    /// applications.
    async fn delete(&self, id: OrgId) -> Result<(), StoreError>;
}
