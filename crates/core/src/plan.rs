use serde::{Deserialize, Serialize};

/// Usage limits attached to an organization's plan.
///
/// Every limit is optional; `None` means unlimited. Overage extends each
/// limit by `limit * overage_percent / 100`; once overage is consumed a
/// grace period of `grace_period_hours` starts, after which further usage
/// is hard-rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Maximum concurrently open tunnels.
    pub concurrent_tunnels: Option<u32>,

    /// Forwarded requests per billing month.
    pub requests_monthly: Option<u64>,

    /// Forwarded bandwidth per billing month, in bytes.
    pub bandwidth_bytes_monthly: Option<u64>,

    /// Cumulative tunnel-hours per billing month.
    pub tunnel_hours_monthly: Option<u64>,

    /// Percentage of each limit granted as overage allowance.
    #[serde(default)]
    pub overage_percent: u32,

    /// Hours of grace after overage is consumed before hard rejection.
    #[serde(default)]
    pub grace_period_hours: u32,
}

impl PlanLimits {
    /// An explicitly unlimited plan.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            concurrent_tunnels: None,
            requests_monthly: None,
            bandwidth_bytes_monthly: None,
            tunnel_hours_monthly: None,
            overage_percent: 0,
            grace_period_hours: 0,
        }
    }

    /// A limit extended by the plan's overage allowance.
    #[must_use]
    pub fn with_overage(&self, limit: u64) -> u64 {
        limit.saturating_add(limit.saturating_mul(u64::from(self.overage_percent)) / 100)
    }
}
