use async_trait::async_trait;
use ipnet::IpNet;
use uuid::Uuid;

use warren_core::{AccountId, AppId, OrgId, WhitelistEntry, WhitelistScope};

use crate::error::StoreError;

/// The four whitelist tiers relevant to one request, parsed and ready for
/// matching. Tiers without entries are empty vectors.
#[derive(Debug, Clone, Default)]
pub struct WhitelistSets {
    pub account: Vec<IpNet>,
    pub app: Vec<IpNet>,
    pub org: Vec<IpNet>,
    pub global: Vec<IpNet>,
}

impl WhitelistSets {
    /// Whether every tier is empty (the stack admits all addresses).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.account.is_empty()
            && self.app.is_empty()
            && self.org.is_empty()
            && self.global.is_empty()
    }
}

/// Typed operations over whitelist entries.
#[async_trait]
pub trait WhitelistStore: Send + Sync {
    async fn entries(&self, scope: &WhitelistScope) -> Result<Vec<WhitelistEntry>, StoreError>;

    /// Fetch the tiers relevant to one request in a single call.
    /// `None` arguments leave the corresponding tier empty.
    async fn scoped(
        &self,
        app: Option<AppId>,
        org: Option<OrgId>,
        account: Option<AccountId>,
    ) -> Result<WhitelistSets, StoreError>;

    async fn add(&self, entry: WhitelistEntry) -> Result<(), StoreError>;

    /// Returns `true` if the entry existed.
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;
}
