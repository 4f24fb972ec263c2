//! Four-tier IP whitelist evaluation.
//!
//! Tiers are consulted top-down: account (tunnel-client connections only),
//! application, organization, global. The first tier with any entries is
//! authoritative — an address missing from it is denied even if a lower
//! tier would admit it. A stack with no entries at all admits everything.
//!
//! Matching is a linear scan over parsed `IpNet`s; tier sets are small in
//! practice.

use std::net::IpAddr;

use ipnet::IpNet;

use warren_store::WhitelistSets;

/// Whether `addr` matches any entry of one tier.
#[must_use]
pub fn allows(tier: &[IpNet], addr: IpAddr) -> bool {
    tier.iter().any(|net| net.contains(&addr))
}

/// Evaluate the full tier stack for one request.
///
/// `include_account_tier` is set only for tunnel-client connections;
/// public requests skip that tier entirely.
#[must_use]
pub fn allows_for_request(sets: &WhitelistSets, addr: IpAddr, include_account_tier: bool) -> bool {
    let tiers: [&[IpNet]; 4] = [
        if include_account_tier {
            &sets.account
        } else {
            &[]
        },
        &sets.app,
        &sets.org,
        &sets.global,
    ];
    for tier in tiers {
        if !tier.is_empty() {
            return allows(tier, addr);
        }
    }
    // Empty stack: admit.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn empty_stack_admits_all() {
        let sets = WhitelistSets::default();
        assert!(allows_for_request(&sets, addr("203.0.113.1"), false));
    }

    #[test]
    fn first_nonempty_tier_is_authoritative() {
        let sets = WhitelistSets {
            app: vec![net("10.0.0.0/8")],
            // The global tier would admit this address, but app is
            // authoritative once it has entries.
            global: vec![net("0.0.0.0/0")],
            ..WhitelistSets::default()
        };
        assert!(!allows_for_request(&sets, addr("203.0.113.1"), false));
        assert!(allows_for_request(&sets, addr("10.1.2.3"), false));
    }

    #[test]
    fn account_tier_only_applies_to_tunnel_connections() {
        let sets = WhitelistSets {
            account: vec![net("192.0.2.0/24")],
            global: vec![net("0.0.0.0/0")],
            ..WhitelistSets::default()
        };
        // Public request: account tier skipped, global admits.
        assert!(allows_for_request(&sets, addr("203.0.113.1"), false));
        // Tunnel connection: account tier is authoritative and denies.
        assert!(!allows_for_request(&sets, addr("203.0.113.1"), true));
        assert!(allows_for_request(&sets, addr("192.0.2.50"), true));
    }

    #[test]
    fn empty_tiers_are_skipped() {
        let sets = WhitelistSets {
            org: vec![net("198.51.100.0/24")],
            ..WhitelistSets::default()
        };
        assert!(allows_for_request(&sets, addr("198.51.100.9"), false));
        assert!(!allows_for_request(&sets, addr("198.51.101.9"), false));
    }

    #[test]
    fn v6_entries_match_v6_addresses() {
        let sets = WhitelistSets {
            global: vec![net("2001:db8::/32")],
            ..WhitelistSets::default()
        };
        assert!(allows_for_request(&sets, addr("2001:db8::1"), false));
        assert!(!allows_for_request(&sets, addr("2001:db9::1"), false));
    }

    #[test]
    fn widening_a_tier_never_shrinks_admission() {
        let base = WhitelistSets {
            global: vec![net("10.0.0.0/16")],
            ..WhitelistSets::default()
        };
        let widened = WhitelistSets {
            global: vec![net("10.0.0.0/16"), net("172.16.0.0/12")],
            ..WhitelistSets::default()
        };
        for candidate in ["10.0.1.1", "172.16.5.5", "8.8.8.8"] {
            let a = candidate.parse().unwrap();
            if allows_for_request(&base, a, false) {
                assert!(allows_for_request(&widened, a, false));
            }
        }
    }
}
