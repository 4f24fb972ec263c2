//! Client-address extraction behind trusted proxies.
//!
//! Forwarding headers are attacker-controlled unless the immediate peer is
//! a proxy we operate, so the walk is strict: starting from the socket
//! peer, `X-Forwarded-For` entries are consumed right-to-left only while
//! each hop is inside the trusted set; the first untrusted hop is the
//! client.

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Whether `addr` is inside any trusted range.
#[must_use]
pub fn is_trusted(addr: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&addr))
}

/// Resolve the client address for a request.
///
/// With an untrusted peer the socket address is authoritative and every
/// forwarding header is ignored. With a trusted peer, `X-Forwarded-For` is
/// walked right-to-left past trusted hops; `X-Real-IP` is a fallback when
/// no forwarded chain is present.
#[must_use]
pub fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> IpAddr {
    if !is_trusted(peer, trusted) {
        return peer;
    }

    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(chain) = forwarded.to_str()
    {
        let mut candidate = None;
        for hop in chain.rsplit(',') {
            let Ok(addr) = hop.trim().parse::<IpAddr>() else {
                // A garbage hop poisons everything to its left.
                break;
            };
            candidate = Some(addr);
            if !is_trusted(addr, trusted) {
                break;
            }
        }
        if let Some(addr) = candidate {
            return addr;
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(raw) = real_ip.to_str()
        && let Ok(addr) = raw.trim().parse::<IpAddr>()
    {
        return addr;
    }

    peer
}
