//! Repository contracts the Warren core consumes.
//!
//! The durable store itself is an external collaborator; the core speaks
//! only through these traits. Implementations must be `Send + Sync` and
//! safe for concurrent access. A missing row is `Ok(None)`, never an error;
//! transient contention surfaces as [`StoreError::Busy`] and write paths
//! retry it with backoff via [`with_busy_retry`].

pub mod accounts;
pub mod apps;
pub mod error;
pub mod keys;
pub mod orgs;
pub mod policies;
pub mod ratelimit;
pub mod sessions;
pub mod tunnels;
pub mod usage;
pub mod whitelist;

use std::sync::Arc;

pub use accounts::AccountStore;
pub use apps::AppStore;
pub use error::{StoreError, with_busy_retry};
pub use keys::ApiKeyStore;
pub use orgs::OrgStore;
pub use policies::PolicyStore;
pub use ratelimit::RateLimitStore;
pub use sessions::SessionStore;
pub use tunnels::TunnelStore;
pub use usage::{UsageDelta, UsageStore};
pub use whitelist::{WhitelistSets, WhitelistStore};

/// The full set of repository handles wired at startup.
///
/// Cloning is cheap; every field is an `Arc`.
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountStore>,
    pub orgs: Arc<dyn OrgStore>,
    pub apps: Arc<dyn AppStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub keys: Arc<dyn ApiKeyStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub ratelimit: Arc<dyn RateLimitStore>,
    pub tunnels: Arc<dyn TunnelStore>,
    pub usage: Arc<dyn UsageStore>,
    pub whitelist: Arc<dyn WhitelistStore>,
}
