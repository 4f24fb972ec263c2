use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{AccountId, AppId, OrgId};

/// The tier a whitelist entry applies to.
///
/// Evaluation is top-down (account, app, org, global) and the first tier
/// with any entries is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum WhitelistScope {
    Global,
    Org { org_id: OrgId },
    App { app_id: AppId },
    Account { account_id: AccountId },
}

/// A single whitelist row: one address or CIDR range in one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    /// Unique entry identifier.
    pub id: Uuid,

    /// Tier the entry applies to.
    pub scope: WhitelistScope,

    /// The admitted range. Single addresses normalize to /32 or /128.
    pub cidr: IpNet,
}

impl WhitelistEntry {
    /// Create an entry from an already-parsed range.
    #[must_use]
    pub fn new(scope: WhitelistScope, cidr: IpNet) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            cidr,
        }
    }
}

/// Parse either a bare address or a CIDR range.
///
/// `1.2.3.4` becomes `1.2.3.4/32`, `::1` becomes `::1/128`; anything with a
/// slash parses as a network.
pub fn parse_ip_or_cidr(raw: &str) -> Result<IpNet, ipnet::AddrParseError> {
    let trimmed = raw.trim();
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        return Ok(IpNet::from(addr));
    }
    trimmed.parse::<IpNet>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_becomes_host_network() {
        assert_eq!(
            parse_ip_or_cidr("1.2.3.4").unwrap().to_string(),
            "1.2.3.4/32"
        );
        assert_eq!(parse_ip_or_cidr("::1").unwrap().to_string(), "::1/128");
    }

    #[test]
    fn cidr_parses_as_given() {
        assert_eq!(
            parse_ip_or_cidr("10.0.0.0/8").unwrap().to_string(),
            "10.0.0.0/8"
        );
        assert!(parse_ip_or_cidr("not-an-ip").is_err());
    }
}
