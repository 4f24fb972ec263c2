use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AppId, OrgId};
use crate::subdomain::Subdomain;

/// How a persistent application resolves its effective auth policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Use the owning organization's policy (the default).
    #[default]
    Inherit,
    /// Public: no authentication for this application.
    Disabled,
    /// Use the application's own policy row.
    Custom,
}

/// A persistent application owning a reserved subdomain.
///
/// The subdomain is globally unique and is the primary routing key; an
/// ephemeral registration can never shadow it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Unique application identifier.
    pub id: AppId,

    /// Owning organization.
    pub org_id: OrgId,

    /// Globally unique subdomain claimed by this application.
    pub subdomain: Subdomain,

    /// Auth policy resolution mode.
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// When the application was created.
    pub created_at: DateTime<Utc>,
}

impl Application {
    /// Create a new application in the default `Inherit` mode.
    #[must_use]
    pub fn new(org_id: OrgId, subdomain: Subdomain) -> Self {
        Self {
            id: AppId::new(),
            org_id,
            subdomain,
            auth_mode: AuthMode::default(),
            created_at: Utc::now(),
        }
    }
}
