use async_trait::async_trait;

use warren_core::{AppId, AuthPolicy, OrgId};

use crate::error::StoreError;

/// Typed operations over auth policy rows.
///
/// At most one policy exists per organization and one per application; a
/// missing row means "no policy at this level" and is `Ok(None)`.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn org_policy(&self, org: OrgId) -> Result<Option<AuthPolicy>, StoreError>;

    async fn app_policy(&self, app: AppId) -> Result<Option<AuthPolicy>, StoreError>;

    async fn put_org_policy(&self, org: OrgId, policy: AuthPolicy) -> Result<(), StoreError>;

    async fn put_app_policy(&self, app: AppId, policy: AuthPolicy) -> Result<(), StoreError>;

    /// Remove the org-level policy. Returns `true` if a row existed.
    async fn delete_org_policy(&self, org: OrgId) -> Result<bool, StoreError>;

    /// Remove the app-level policy. Returns `true` if a row existed.
    async fn delete_app_policy(&self, app: AppId) -> Result<bool, StoreError>;
}
