use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::OrgId;
use crate::plan::PlanLimits;

/// A tenant organization. Owns applications, an optional auth policy, and a
/// plan that bounds tunnel usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    /// Unique organization identifier.
    pub id: OrgId,

    /// Unique human-readable name.
    pub name: String,

    /// Plan limits; `None` means the unlimited default plan.
    pub plan: Option<PlanLimits>,

    /// When the organization was created.
    pub created_at: DateTime<Utc>,
}

impl Organization {
    /// Create a new organization with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, plan: Option<PlanLimits>) -> Self {
        Self {
            id: OrgId::new(),
            name: name.into(),
            plan,
            created_at: Utc::now(),
        }
    }
}
