use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AppId, KeyId, OrgId};

/// A scoped API key.
///
/// The scope is the `(org_id, app_id?)` pair: `app_id = None` authorizes
/// every application in the organization. Only the SHA-256 hex digest of the
/// raw key is stored; `prefix` keeps the first printable characters for
/// display and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Unique key identifier.
    pub id: KeyId,

    /// Organization the key belongs to.
    pub org_id: OrgId,

    /// Restricting application, if the key is app-scoped.
    pub app_id: Option<AppId>,

    /// SHA-256 hex digest of the raw key.
    pub key_hash: String,

    /// Short printable prefix of the raw key, for display only.
    pub prefix: String,

    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,

    /// Updated on every successful validation.
    pub last_used_at: Option<DateTime<Utc>>,

    /// When the key was created.
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether the key has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the key's scope covers a request resolved to `(org, app)`.
    ///
    /// An org-wide key (no `app_id`) covers every app in its org; an
    /// app-scoped key covers only that app.
    #[must_use]
    pub fn covers(&self, org: OrgId, app: Option<AppId>) -> bool {
        if self.org_id != org {
            return false;
        }
        match self.app_id {
            None => true,
            Some(scoped) => app == Some(scoped),
        }
    }
}
