use serde::{Deserialize, Serialize};

/// Closed taxonomy of failure reasons emitted on audit events and in wire
/// responses.
///
/// The string forms are part of the external contract; adding a variant is
/// fine, renaming one is a breaking change for audit consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MissingCredentials,
    InvalidCredentials,
    ExpiredCredentials,
    ExpiredSession,
    UnknownKey,
    ScopeMismatch,
    DomainNotAllowed,
    ClaimMismatch,
    PolicyUnavailable,
    RateLimited,
    IpNotWhitelisted,
    QuotaExceededConcurrent,
    QuotaExceededBandwidth,
    QuotaExceededRequests,
    SubdomainConflict,
    SubdomainReserved,
    NoTunnel,
    TunnelTimeout,
    ProtocolError,
}

impl FailureReason {
    /// The canonical snake_case wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidCredentials => "invalid_credentials",
            Self::ExpiredCredentials => "expired_credentials",
            Self::ExpiredSession => "expired_session",
            Self::UnknownKey => "unknown_key",
            Self::ScopeMismatch => "scope_mismatch",
            Self::DomainNotAllowed => "domain_not_allowed",
            Self::ClaimMismatch => "claim_mismatch",
            Self::PolicyUnavailable => "policy_unavailable",
            Self::RateLimited => "rate_limited",
            Self::IpNotWhitelisted => "ip_not_whitelisted",
            Self::QuotaExceededConcurrent => "quota_exceeded_concurrent",
            Self::QuotaExceededBandwidth => "quota_exceeded_bandwidth",
            Self::QuotaExceededRequests => "quota_exceeded_requests",
            Self::SubdomainConflict => "subdomain_conflict",
            Self::SubdomainReserved => "subdomain_reserved",
            Self::NoTunnel => "no_tunnel",
            Self::TunnelTimeout => "tunnel_timeout",
            Self::ProtocolError => "protocol_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
