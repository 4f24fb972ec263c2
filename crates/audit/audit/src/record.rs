use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warren_core::{AppId, AuthType, FailureReason, KeyId, OrgId};

/// One authentication or forwarding decision.
///
/// Append-only; the failure reason is present exactly when `success` is
/// false and is drawn from the closed [`FailureReason`] taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    /// Unique event id (UUID v7, so ids sort roughly by time).
    pub id: Uuid,

    /// When the decision was made.
    pub timestamp: DateTime<Utc>,

    /// Organization context, when the subdomain resolved to one.
    pub org_id: Option<OrgId>,

    /// Application context, when the subdomain resolved to one.
    pub app_id: Option<AppId>,

    /// Mechanism that made the decision.
    pub auth_type: AuthType,

    /// Whether the request was admitted at this decision point.
    pub success: bool,

    /// Failure reason; `None` on success.
    pub reason: Option<FailureReason>,

    /// Extracted client address.
    pub source_ip: IpAddr,

    /// Authenticated subject, when one was established.
    pub identity: Option<String>,

    /// API key involved, if the decision validated one.
    pub key_id: Option<KeyId>,
}

impl AuthEvent {
    /// A success event.
    #[must_use]
    pub fn success(auth_type: AuthType, source_ip: IpAddr) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            org_id: None,
            app_id: None,
            auth_type,
            success: true,
            reason: None,
            source_ip,
            identity: None,
            key_id: None,
        }
    }

    /// A failure event carrying its reason.
    #[must_use]
    pub fn failure(auth_type: AuthType, source_ip: IpAddr, reason: FailureReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            ..Self::success(auth_type, source_ip)
        }
    }

    /// Attach organization/application context.
    #[must_use]
    pub fn scoped(mut self, org_id: Option<OrgId>, app_id: Option<AppId>) -> Self {
        self.org_id = org_id;
        self.app_id = app_id;
        self
    }

    /// Attach the authenticated subject.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Attach the validated API key id.
    #[must_use]
    pub fn with_key(mut self, key_id: KeyId) -> Self {
        self.key_id = Some(key_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_carries_reason_success_does_not() {
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        let ok = AuthEvent::success(AuthType::Basic, addr);
        assert!(ok.success);
        assert!(ok.reason.is_none());

        let bad = AuthEvent::failure(AuthType::Basic, addr, FailureReason::InvalidCredentials);
        assert!(!bad.success);
        assert_eq!(bad.reason, Some(FailureReason::InvalidCredentials));
    }
}
