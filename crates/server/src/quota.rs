//! Live quota accounting and enforcement.
//!
//! Concurrency uses an increment-first counter per organization: the
//! reservation is taken before the decision and rolled back on rejection,
//! so concurrent registrations for the same org cannot slip past the limit
//! between a read and a write. Request and bandwidth checks compare the
//! current billing-month counters against limit plus overage.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warren_core::{FailureReason, OrgId, PlanLimits, UsagePeriod};
use warren_store::{OrgStore, UsageDelta, UsageStore};

/// Plan lookups are cached briefly; admin edits show up within this TTL.
const PLAN_CACHE_TTL: Duration = Duration::from_secs(60);

/// A denied quota check, with everything the 429 response needs.
#[derive(Debug, Clone)]
pub struct QuotaDenial {
    pub reason: FailureReason,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_seconds: u64,
}

struct CachedPlan {
    plan: Option<PlanLimits>,
    cached_at: Instant,
}

/// Per-organization quota state and enforcement.
pub struct QuotaAccountant {
    orgs: Arc<dyn OrgStore>,
    usage: Arc<dyn UsageStore>,
    live: DashMap<OrgId, AtomicI64>,
    /// When each org's concurrency overage grace period started.
    grace_started: DashMap<OrgId, DateTime<Utc>>,
    plans: DashMap<OrgId, CachedPlan>,
}

impl QuotaAccountant {
    #[must_use]
    pub fn new(orgs: Arc<dyn OrgStore>, usage: Arc<dyn UsageStore>) -> Self {
        Self {
            orgs,
            usage,
            live: DashMap::new(),
            grace_started: DashMap::new(),
            plans: DashMap::new(),
        }
    }

    /// Live tunnel count currently accounted to `org`.
    #[must_use]
    pub fn live_count(&self, org: OrgId) -> i64 {
        self.live.get(&org).map_or(0, |c| c.load(Ordering::SeqCst))
    }

    async fn plan(&self, org: OrgId) -> Option<PlanLimits> {
        if let Some(cached) = self.plans.get(&org)
            && cached.cached_at.elapsed() < PLAN_CACHE_TTL
        {
            return cached.plan.clone();
        }
        // Fail open on a store fault: quota protects billing, not safety.
        let plan = match self.orgs.get(org).await {
            Ok(row) => row.and_then(|o| o.plan),
            Err(e) => {
                warn!(error = %e, %org, "plan lookup failed (fail-open)");
                return None;
            }
        };
        self.plans.insert(
            org,
            CachedPlan {
                plan: plan.clone(),
                cached_at: Instant::now(),
            },
        );
        plan
    }

    /// Reserve one concurrency slot for a registration.
    ///
    /// On `Err` the reservation has already been rolled back. On `Ok` the
    /// slot is held until [`release_registration`](Self::release_registration).
    pub async fn check_registration(&self, org: OrgId) -> Result<(), QuotaDenial> {
        let now = Utc::now();
        let reserved = {
            let counter = self.live.entry(org).or_insert_with(|| AtomicI64::new(0));
            counter.fetch_add(1, Ordering::SeqCst) + 1
        };

        let Some(plan) = self.plan(org).await else {
            return Ok(());
        };
        let Some(limit) = plan.concurrent_tunnels else {
            return Ok(());
        };

        let limit = u64::from(limit);
        let allowed = plan.with_overage(limit);
        #[allow(clippy::cast_sign_loss)]
        let used = reserved.max(0) as u64;

        if used <= limit {
            self.grace_started.remove(&org);
            return Ok(());
        }
        if used <= allowed {
            // Inside the overage allowance.
            return Ok(());
        }

        // Overage consumed: a grace period starts; past it, hard-reject.
        // A zero-hour grace rejects immediately.
        let started = *self.grace_started.entry(org).or_insert(now);
        let grace = chrono::Duration::hours(i64::from(plan.grace_period_hours));
        if now - started < grace {
            return Ok(());
        }

        self.rollback(org);
        Err(QuotaDenial {
            reason: FailureReason::QuotaExceededConcurrent,
            limit,
            used: used - 1,
            remaining: 0,
            reset_at: now + chrono::Duration::seconds(60),
            retry_after_seconds: 60,
        })
    }

    /// Pay back a reservation whose registration did not commit.
    pub fn rollback(&self, org: OrgId) {
        if let Some(counter) = self.live.get(&org) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// A registration committed: feed the concurrency delta to usage.
    pub async fn registered(&self, org: OrgId) {
        let delta = UsageDelta {
            concurrency: 1,
            ..UsageDelta::default()
        };
        if let Err(e) = self.usage.increment(org, delta).await {
            warn!(error = %e, %org, "usage increment failed");
        }
    }

    /// A tunnel closed: release the slot and account its lifetime.
    pub async fn release_registration(&self, org: OrgId, tunnel_seconds: u64) {
        self.rollback(org);
        let delta = UsageDelta {
            tunnel_seconds,
            concurrency: -1,
            ..UsageDelta::default()
        };
        if let Err(e) = self.usage.increment(org, delta).await {
            warn!(error = %e, %org, "usage increment failed");
        }
    }

    /// Gate one forwarded request against the monthly counters.
    pub async fn check_request(
        &self,
        org: OrgId,
        projected_bytes: u64,
    ) -> Result<(), QuotaDenial> {
        let Some(plan) = self.plan(org).await else {
            return Ok(());
        };
        let now = Utc::now();
        let snapshot = match self.usage.current(org, UsagePeriod::Month, now).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, %org, "usage read failed (fail-open)");
                return Ok(());
            }
        };
        let reset_at = next_month_start(now);
        #[allow(clippy::cast_sign_loss)]
        let retry_after_seconds = (reset_at - now).num_seconds().max(1) as u64;

        if let Some(limit) = plan.requests_monthly {
            let allowed = plan.with_overage(limit);
            if snapshot.request_count + 1 > allowed {
                return Err(QuotaDenial {
                    reason: FailureReason::QuotaExceededRequests,
                    limit,
                    used: snapshot.request_count,
                    remaining: allowed.saturating_sub(snapshot.request_count),
                    reset_at,
                    retry_after_seconds,
                });
            }
        }
        if let Some(limit) = plan.bandwidth_bytes_monthly {
            let allowed = plan.with_overage(limit);
            if snapshot.bandwidth_bytes.saturating_add(projected_bytes) > allowed {
                return Err(QuotaDenial {
                    reason: FailureReason::QuotaExceededBandwidth,
                    limit,
                    used: snapshot.bandwidth_bytes,
                    remaining: allowed.saturating_sub(snapshot.bandwidth_bytes),
                    reset_at,
                    retry_after_seconds,
                });
            }
        }
        Ok(())
    }

    /// A request was forwarded: count it and its bytes.
    pub async fn record_request(&self, org: OrgId, bytes: u64) {
        if let Err(e) = self.usage.increment(org, UsageDelta::request(bytes)).await {
            warn!(error = %e, %org, "usage increment failed");
        }
    }
}

fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Periodic snapshot roll-up until cancelled, with a final pass.
pub async fn run_rollup(
    usage: Arc<dyn UsageStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => rollup_all(&usage).await,
            () = cancel.cancelled() => {
                rollup_all(&usage).await;
                break;
            }
        }
    }
}

async fn rollup_all(usage: &Arc<dyn UsageStore>) {
    let now = Utc::now();
    for period in [UsagePeriod::Hour, UsagePeriod::Day, UsagePeriod::Month] {
        if let Err(e) = usage.rollup(period, now).await {
            warn!(error = %e, %period, "usage rollup failed");
        }
    }
}
