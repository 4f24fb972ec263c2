//! Core domain types for the Warren tunnel service.
//!
//! This crate defines the entities shared by the edge server, the tunnel
//! registry, and the store backends: organizations, accounts, applications,
//! auth policies, API keys, sessions, rate-limit state, whitelists, usage
//! counters, and the closed failure-reason taxonomy emitted on audit and
//! wire responses.

pub mod account;
pub mod api_key;
pub mod app;
pub mod ids;
pub mod org;
pub mod plan;
pub mod policy;
pub mod ratelimit;
pub mod reason;
pub mod session;
pub mod subdomain;
pub mod tunnel_record;
pub mod usage;
pub mod whitelist;

pub use account::Account;
pub use api_key::ApiKey;
pub use app::{Application, AuthMode};
pub use ids::{AccountId, AppId, KeyId, OrgId, TunnelId};
pub use org::Organization;
pub use plan::PlanLimits;
pub use policy::{AuthPolicy, AuthScheme, AuthType, OidcConfig};
pub use ratelimit::{RateLimitKey, RateLimitState};
pub use reason::FailureReason;
pub use session::{AuthSession, Identity};
pub use subdomain::{Subdomain, SubdomainError};
pub use tunnel_record::TunnelRecord;
pub use usage::{UsagePeriod, UsageSnapshot, period_start};
pub use whitelist::{WhitelistEntry, WhitelistScope, parse_ip_or_cidr};
