use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::OrgId;

/// Roll-up granularity for usage snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePeriod {
    Hour,
    Day,
    Month,
}

impl UsagePeriod {
    /// Short label used in snapshot keys and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

impl std::fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truncate `now` to the start of its enclosing period.
///
/// Used both for keying live counters and for deciding when a period has
/// rolled over.
#[must_use]
pub fn period_start(period: UsagePeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        UsagePeriod::Hour => Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
            .single()
            .unwrap_or(now),
        UsagePeriod::Day => Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now),
        UsagePeriod::Month => Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now),
    }
}

/// Aggregated usage for one organization over one period.
///
/// Bandwidth counters are `u64` and must preserve values up to 2^63 − 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Organization the snapshot belongs to.
    pub org_id: OrgId,

    /// Granularity of the snapshot.
    pub period: UsagePeriod,

    /// Start of the period the snapshot covers.
    pub period_start: DateTime<Utc>,

    /// Bytes forwarded in either direction.
    pub bandwidth_bytes: u64,

    /// Cumulative open-tunnel seconds.
    pub tunnel_seconds: u64,

    /// Forwarded request count.
    pub request_count: u64,

    /// Highest concurrent-tunnel count observed.
    pub peak_concurrent: u32,
}

impl UsageSnapshot {
    /// An empty snapshot for the period containing `now`.
    #[must_use]
    pub fn empty(org_id: OrgId, period: UsagePeriod, now: DateTime<Utc>) -> Self {
        Self {
            org_id,
            period,
            period_start: period_start(period, now),
            bandwidth_bytes: 0,
            tunnel_seconds: 0,
            request_count: 0,
            peak_concurrent: 0,
        }
    }
}
