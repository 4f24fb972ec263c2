//! Effective-policy resolution and the TTL cache in front of it.
//!
//! Resolution order for a subdomain: persistent application override
//! (`disabled` / `custom`), then the owning organization's default, then
//! none. Ephemeral subdomains are public — authentication belongs to the
//! tunnel-client layer, not to their public traffic.
//!
//! The cache is keyed by subdomain and carries the resolved org/app ids so
//! invalidation by either id can find every dependent entry. Store errors
//! surface as an explicit deny-on-error verdict; a missing policy row is
//! not an error, it means *none*.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_core::{AppId, AuthMode, AuthPolicy, OrgId, Subdomain};
use warren_store::{AppStore, PolicyStore};

/// The policy store is unreachable; the middleware denies with 503.
#[derive(Debug, Error)]
#[error("policy resolution unavailable")]
pub struct PolicyUnavailable;

/// A fully resolved policy decision for one subdomain.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    /// The policy to enforce; `None` means public.
    pub policy: Option<AuthPolicy>,
    /// Organization context, when the subdomain belongs to an app.
    pub org_id: Option<OrgId>,
    /// Application context, when the subdomain belongs to an app.
    pub app_id: Option<AppId>,
    /// The app's configured mode, for the health endpoint.
    pub auth_mode: Option<AuthMode>,
    /// Whether the owning organization has a policy row at all.
    pub org_has_policy: bool,
}

impl ResolvedPolicy {
    fn public() -> Self {
        Self {
            policy: None,
            org_id: None,
            app_id: None,
            auth_mode: None,
            org_has_policy: false,
        }
    }
}

struct CachedResolution {
    resolved: ResolvedPolicy,
    cached_at: Instant,
}

/// TTL cache over the resolver with per-entity invalidation.
pub struct PolicyLoader {
    apps: Arc<dyn AppStore>,
    policies: Arc<dyn PolicyStore>,
    ttl: Duration,
    cache: RwLock<HashMap<Subdomain, CachedResolution>>,
}

impl PolicyLoader {
    #[must_use]
    pub fn new(apps: Arc<dyn AppStore>, policies: Arc<dyn PolicyStore>, ttl: Duration) -> Self {
        Self {
            apps,
            policies,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the effective policy for `subdomain`, consulting the cache.
    pub async fn resolve(&self, subdomain: &Subdomain) -> Result<ResolvedPolicy, PolicyUnavailable> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(subdomain)
                && entry.cached_at.elapsed() < self.ttl
            {
                return Ok(entry.resolved.clone());
            }
        }

        let resolved = self.resolve_uncached(subdomain).await?;
        self.cache.write().insert(
            subdomain.clone(),
            CachedResolution {
                resolved: resolved.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(resolved)
    }

    async fn resolve_uncached(
        &self,
        subdomain: &Subdomain,
    ) -> Result<ResolvedPolicy, PolicyUnavailable> {
        let app = self
            .apps
            .get_by_subdomain(subdomain)
            .await
            .map_err(|e| store_fault("app lookup", &e))?;

        let Some(app) = app else {
            // Ephemeral subdomain: public traffic is not authenticated.
            return Ok(ResolvedPolicy::public());
        };

        let org_policy = self
            .policies
            .org_policy(app.org_id)
            .await
            .map_err(|e| store_fault("org policy", &e))?;
        let org_has_policy = org_policy.is_some();

        let policy = match app.auth_mode {
            AuthMode::Disabled => None,
            AuthMode::Custom => {
                let app_policy = self
                    .policies
                    .app_policy(app.id)
                    .await
                    .map_err(|e| store_fault("app policy", &e))?;
                // A custom app without its own row falls through to the
                // organization default.
                app_policy.or(org_policy)
            }
            AuthMode::Inherit => org_policy,
        };

        Ok(ResolvedPolicy {
            policy,
            org_id: Some(app.org_id),
            app_id: Some(app.id),
            auth_mode: Some(app.auth_mode),
            org_has_policy,
        })
    }

    /// Drop one subdomain's entry.
    pub fn invalidate_subdomain(&self, subdomain: &Subdomain) {
        self.cache.write().remove(subdomain);
    }

    /// Drop every entry resolved through this application.
    pub fn invalidate_app(&self, app: AppId) {
        self.cache
            .write()
            .retain(|_, entry| entry.resolved.app_id != Some(app));
    }

    /// Drop every entry whose resolution referenced this organization.
    pub fn invalidate_org(&self, org: OrgId) {
        self.cache
            .write()
            .retain(|_, entry| entry.resolved.org_id != Some(org));
    }

    /// Remove entries past TTL.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "policy cache sweep");
        }
    }

    /// Cached entry count (test helper).
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

fn store_fault(what: &str, error: &warren_store::StoreError) -> PolicyUnavailable {
    warn!(error = %error, what, "policy resolution failed");
    PolicyUnavailable
}

/// Coarse background sweep until cancelled.
pub async fn run_sweeper(loader: Arc<PolicyLoader>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => loader.sweep(),
            () = cancel.cancelled() => break,
        }
    }
}
