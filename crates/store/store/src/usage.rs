use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warren_core::{OrgId, UsagePeriod, UsageSnapshot};

use crate::error::StoreError;

/// One atomic usage update.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    /// Bytes forwarded in either direction.
    pub bandwidth_bytes: u64,
    /// Forwarded requests.
    pub requests: u64,
    /// Tunnel-seconds accumulated (stamped at close).
    pub tunnel_seconds: u64,
    /// Live-tunnel count change: +1 on registration, -1 on teardown.
    pub concurrency: i64,
}

impl UsageDelta {
    /// A delta counting one forwarded request of `bytes` total size.
    #[must_use]
    pub fn request(bytes: u64) -> Self {
        Self {
            bandwidth_bytes: bytes,
            requests: 1,
            ..Self::default()
        }
    }
}

/// Live per-organization usage counters and periodic snapshots.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Apply a delta to the in-period counters of every granularity.
    /// Positive concurrency deltas update the peak-concurrency watermark.
    async fn increment(&self, org: OrgId, delta: UsageDelta) -> Result<(), StoreError>;

    /// The live counters for the period enclosing `now`. An organization
    /// with no activity yet gets an empty snapshot, not an error.
    async fn current(
        &self,
        org: OrgId,
        period: UsagePeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, StoreError>;

    /// Persist a closed-period snapshot.
    async fn put_snapshot(&self, snapshot: UsageSnapshot) -> Result<(), StoreError>;

    /// Close every finished period at the given granularity: write its
    /// snapshot and reset the in-period counters. Returns how many
    /// organizations rolled over.
    async fn rollup(&self, period: UsagePeriod, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
