use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, AppId, OrgId};

/// Per-key sliding-window counter state.
///
/// Persisted across restarts so a block window survives a process bounce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Failures recorded in the current window.
    pub count: u32,

    /// When the current window opened.
    pub window_start: DateTime<Utc>,

    /// Deny all attempts until this instant, when set.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// A fresh window opened at `now`.
    #[must_use]
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked_until: None,
        }
    }

    /// Whether the key is inside an active block window.
    #[must_use]
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

/// Builders for the rate-limit key namespace.
///
/// Keys are plain strings so the store can treat them opaquely:
/// `ip:<addr>`, `app_ip:<appID>:<addr>`, `org_ip:<orgID>:<addr>`,
/// `user:<id>`.
pub struct RateLimitKey;

impl RateLimitKey {
    /// Global per-address key.
    #[must_use]
    pub fn ip(addr: IpAddr) -> String {
        format!("ip:{addr}")
    }

    /// Per-application per-address key.
    #[must_use]
    pub fn app_ip(app: AppId, addr: IpAddr) -> String {
        format!("app_ip:{app}:{addr}")
    }

    /// Per-organization per-address key.
    #[must_use]
    pub fn org_ip(org: OrgId, addr: IpAddr) -> String {
        format!("org_ip:{org}:{addr}")
    }

    /// Per-account key for authenticated flows.
    #[must_use]
    pub fn user(account: AccountId) -> String {
        format!("user:{account}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(RateLimitKey::ip(addr), "ip:1.2.3.4");
        let app = AppId::new();
        assert_eq!(
            RateLimitKey::app_ip(app, addr),
            format!("app_ip:{app}:1.2.3.4")
        );
    }

    #[test]
    fn block_expiry_is_exclusive() {
        let now = Utc::now();
        let state = RateLimitState {
            count: 0,
            window_start: now,
            blocked_until: Some(now),
        };
        assert!(!state.is_blocked(now));
    }
}
