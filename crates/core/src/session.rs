use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AppId, OrgId};
use crate::policy::AuthType;

/// The authenticated subject attached to a request after a successful auth
/// decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Subject identity: username, key name, or OIDC subject/email.
    pub subject: String,

    /// Mechanism that authenticated the subject.
    pub auth_type: AuthType,
}

impl Identity {
    /// Build an identity.
    #[must_use]
    pub fn new(subject: impl Into<String>, auth_type: AuthType) -> Self {
        Self {
            subject: subject.into(),
            auth_type,
        }
    }
}

/// A server-side browser session.
///
/// The id is 32 bytes of OS randomness encoded as 64 hex characters; it is
/// the only value the cookie carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    /// Opaque high-entropy session id (64 hex chars).
    pub id: String,

    /// Authenticated subject.
    pub identity: Identity,

    /// Organization binding, when the policy resolved to one.
    pub org_id: Option<OrgId>,

    /// Application binding, when the policy resolved to one.
    pub app_id: Option<AppId>,

    /// Snapshot of the claims observed at authentication time.
    pub claims: serde_json::Value,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// When the session stops validating.
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    /// Whether the session has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
