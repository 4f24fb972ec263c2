//! Warren edge server: wildcard-subdomain routing over live tunnels with
//! multi-tenant policy enforcement.
//!
//! Request path: subdomain from the host header, rate-limit pre-check,
//! client-IP extraction behind trusted proxies, IP whitelist, policy
//! resolution, auth handler, quota gate, then a correlated forward over
//! the owner's tunnel. The tunnel control plane attaches over a WebSocket
//! upgrade on the base domain.

pub mod api;
pub mod auth;
pub mod client_ip;
pub mod config;
pub mod headers;
pub mod policy;
pub mod quota;
pub mod ratelimit;
pub mod registration;
pub mod telemetry;
pub mod whitelist;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use warren_audit::BatchingAuditWriter;
use warren_store::Repositories;
use warren_tunnel::TunnelManager;

use crate::auth::oidc::OidcClient;
use crate::config::ValidatedConfig;
use crate::policy::PolicyLoader;
use crate::quota::QuotaAccountant;
use crate::ratelimit::RateLimiter;

/// Shared server state. Cloning is cheap; every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ValidatedConfig>,
    pub repos: Repositories,
    pub audit: Arc<BatchingAuditWriter>,
    pub limiter: Arc<RateLimiter>,
    pub policies: Arc<PolicyLoader>,
    pub quota: Arc<QuotaAccountant>,
    pub tunnels: Arc<TunnelManager>,
    pub oidc: Arc<OidcClient>,
}

/// Assemble the edge router.
///
/// The auth endpoints are served on every subdomain; the tunnel upgrade
/// only answers on the base domain; everything else falls through to the
/// forwarding pipeline.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/__auth/login", get(api::auth_routes::login))
        .route("/__auth/callback", get(api::auth_routes::callback))
        .route("/__auth/logout", get(api::auth_routes::logout))
        .route("/__auth/health", get(api::auth_routes::health))
        .route("/__tunnel", get(api::tunnel_ws::upgrade))
        .fallback(api::forward::handle_public)
        .layer(axum::middleware::from_fn(headers::security_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
