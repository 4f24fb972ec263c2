//! The registry's policy seam: ownership checks, quota reservation, record
//! keeping, and audit around tunnel registrations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use warren_audit::{AuthEvent, BatchingAuditWriter};
use warren_core::{Account, AuthType, FailureReason, Subdomain, TunnelRecord};
use warren_store::{Repositories, with_busy_retry};
use warren_tunnel::{ClaimContext, RegistrationPolicy};

use crate::quota::QuotaAccountant;

/// Production [`RegistrationPolicy`]: consults the app registry for
/// ownership, the quota accountant for concurrency, and writes the tunnel
/// ledger and audit trail.
pub struct EdgeRegistrationPolicy {
    repos: Repositories,
    quota: Arc<QuotaAccountant>,
    audit: Arc<BatchingAuditWriter>,
}

impl EdgeRegistrationPolicy {
    #[must_use]
    pub fn new(
        repos: Repositories,
        quota: Arc<QuotaAccountant>,
        audit: Arc<BatchingAuditWriter>,
    ) -> Self {
        Self {
            repos,
            quota,
            audit,
        }
    }
}

#[async_trait]
impl RegistrationPolicy for EdgeRegistrationPolicy {
    async fn authorize(
        &self,
        account: &Account,
        subdomain: &Subdomain,
    ) -> Result<ClaimContext, FailureReason> {
        // A persistent application pins the subdomain to its organization.
        let app = self
            .repos
            .apps
            .get_by_subdomain(subdomain)
            .await
            .map_err(|_| FailureReason::PolicyUnavailable)?;

        let ctx = match app {
            Some(app) => {
                if !account.may_claim_for(app.org_id) {
                    return Err(FailureReason::SubdomainConflict);
                }
                ClaimContext {
                    org_id: Some(app.org_id),
                    app_id: Some(app.id),
                }
            }
            None => ClaimContext {
                org_id: account.org_id,
                app_id: None,
            },
        };

        if let Some(org) = ctx.org_id {
            self.quota
                .check_registration(org)
                .await
                .map_err(|denial| denial.reason)?;
        }
        Ok(ctx)
    }

    async fn release(&self, ctx: ClaimContext) {
        if let Some(org) = ctx.org_id {
            self.quota.rollback(org);
        }
    }

    async fn opened(&self, record: &TunnelRecord, ctx: ClaimContext) {
        let stored = record.clone();
        let tunnels = Arc::clone(&self.repos.tunnels);
        if let Err(e) = with_busy_retry(|| {
            let tunnels = Arc::clone(&tunnels);
            let row = stored.clone();
            async move { tunnels.record_open(row).await }
        })
        .await
        {
            warn!(error = %e, subdomain = %record.subdomain, "tunnel record open failed");
        }

        if let Some(org) = ctx.org_id {
            self.quota.registered(org).await;
        }

        self.audit.emit(
            AuthEvent::success(AuthType::Token, record.client_ip)
                .scoped(ctx.org_id, ctx.app_id)
                .with_identity(record.account_id.to_string()),
        );
    }

    async fn closed(
        &self,
        record: &TunnelRecord,
        ctx: ClaimContext,
        bytes_in: u64,
        bytes_out: u64,
        reason: &str,
    ) {
        let now = Utc::now();
        let tunnels = Arc::clone(&self.repos.tunnels);
        let id = record.id;
        if let Err(e) = with_busy_retry(|| {
            let tunnels = Arc::clone(&tunnels);
            async move { tunnels.record_close(id, now, bytes_in, bytes_out).await }
        })
        .await
        {
            warn!(error = %e, subdomain = %record.subdomain, "tunnel record close failed");
        }

        if let Some(org) = ctx.org_id {
            self.quota
                .release_registration(org, record.seconds_open(now))
                .await;
        }

        // Closes always audit as successes; `reason` is diagnostic.
        tracing::info!(
            subdomain = %record.subdomain,
            reason,
            bytes_in,
            bytes_out,
            "tunnel closed"
        );
        self.audit.emit(
            AuthEvent::success(AuthType::Token, record.client_ip)
                .scoped(ctx.org_id, ctx.app_id)
                .with_identity(record.account_id.to_string()),
        );
    }
}
