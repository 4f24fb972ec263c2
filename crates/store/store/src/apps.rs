use async_trait::async_trait;

use warren_core::{AppId, Application, OrgId, Subdomain};

use crate::error::StoreError;

/// Typed operations over persistent applications.
#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get(&self, id: AppId) -> Result<Option<Application>, StoreError>;

    /// The routing lookup: the application owning `subdomain`, if any.
    async fn get_by_subdomain(&self, subdomain: &Subdomain)
    -> Result<Option<Application>, StoreError>;

    async fn list_by_org(&self, org: OrgId) -> Result<Vec<Application>, StoreError>;

    /// Create an application. A duplicate subdomain is a
    /// [`StoreError::Conflict`] — the subdomain is globally unique.
    async fn create(&self, app: Application) -> Result<(), StoreError>;

    async fn update(&self, app: Application) -> Result<(), StoreError>;

    async fn delete(&self, id: AppId) -> Result<(), StoreError>;
}
