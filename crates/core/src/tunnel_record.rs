use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, AppId, TunnelId};
use crate::subdomain::Subdomain;

/// Historical row written for every accepted registration.
///
/// Open tunnels have `closed_at = None`; teardown stamps the close time and
/// the final byte counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    /// Unique record identifier.
    pub id: TunnelId,

    /// Account that registered the tunnel.
    pub account_id: AccountId,

    /// Claimed subdomain.
    pub subdomain: Subdomain,

    /// Client address observed at registration.
    pub client_ip: IpAddr,

    /// Persistent application, when the subdomain belongs to one.
    pub app_id: Option<AppId>,

    /// When the registration was accepted.
    pub opened_at: DateTime<Utc>,

    /// When the tunnel closed; `None` while live.
    pub closed_at: Option<DateTime<Utc>>,

    /// Bytes forwarded client-ward (request bodies).
    pub bytes_in: u64,

    /// Bytes forwarded caller-ward (response bodies).
    pub bytes_out: u64,
}

impl TunnelRecord {
    /// Open a new record at `Utc::now()`.
    #[must_use]
    pub fn open(
        account_id: AccountId,
        subdomain: Subdomain,
        client_ip: IpAddr,
        app_id: Option<AppId>,
    ) -> Self {
        Self {
            id: TunnelId::new(),
            account_id,
            subdomain,
            client_ip,
            app_id,
            opened_at: Utc::now(),
            closed_at: None,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Tunnel-seconds accumulated so far, or the final figure once closed.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn seconds_open(&self, now: DateTime<Utc>) -> u64 {
        let end = self.closed_at.unwrap_or(now);
        (end - self.opened_at).num_seconds().max(0) as u64
    }
}
