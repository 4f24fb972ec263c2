use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, OrgId};

/// A tunnel-client or admin account.
///
/// The account token is issued once and persisted only as its SHA-256 hex
/// digest; the raw token never touches the store. The password hash, when
/// present, is an argon2 PHC string used by the admin surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,

    /// Unique username.
    pub username: String,

    /// SHA-256 hex digest of the raw account token.
    pub token_hash: String,

    /// Optional argon2 password hash.
    pub password_hash: Option<String>,

    /// Optional TOTP secret, stored as an `ENC[...]` envelope.
    pub totp_secret_enc: Option<String>,

    /// System administrator flag.
    pub is_admin: bool,

    /// Organization administrator flag.
    pub is_org_admin: bool,

    /// Owning organization, if any.
    pub org_id: Option<OrgId>,

    /// Soft-deactivation flag. Inactive accounts fail token validation.
    pub active: bool,

    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new active account holding a pre-hashed token.
    #[must_use]
    pub fn new(username: impl Into<String>, token_hash: impl Into<String>) -> Self {
        Self {
            id: AccountId::new(),
            username: username.into(),
            token_hash: token_hash.into(),
            password_hash: None,
            totp_secret_enc: None,
            is_admin: false,
            is_org_admin: false,
            org_id: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Whether this account may claim a subdomain owned by an application in
    /// `org`: members of the same organization and system admins may.
    #[must_use]
    pub fn may_claim_for(&self, org: OrgId) -> bool {
        self.is_admin || self.org_id == Some(org)
    }
}
