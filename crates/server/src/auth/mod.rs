//! Credential enforcement: the tagged dispatch over {basic, api-key, oidc}
//! with a uniform outcome contract.
//!
//! Every handler resolves to an [`AuthOutcome`]; the pipeline turns that
//! into a response, an audit event, and a rate-limit record. API-key
//! acceptance is orthogonal: any policy may additionally accept a valid
//! scoped key, and a request presenting one is treated as an API client —
//! it gets the key verdict and never a challenge or redirect.

pub mod api_key;
pub mod basic;
pub mod oidc;
pub mod session;

use std::net::IpAddr;

use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::Cookie;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::warn;

use warren_core::{AuthPolicy, AuthScheme, AuthType, FailureReason, Identity, KeyId};

use crate::AppState;
use crate::policy::ResolvedPolicy;

/// The request surface the handlers look at.
pub struct AuthRequest<'r> {
    pub headers: &'r HeaderMap,
    pub jar: &'r CookieJar,
    /// Original path and query, for post-login redirects.
    pub path_and_query: &'r str,
    pub client_ip: IpAddr,
}

/// Uniform outcome of the auth stage.
pub enum AuthOutcome {
    /// No policy applies; skip straight to the quota gate.
    Public,
    /// Authenticated.
    Success {
        identity: Identity,
        /// Session cookie to set, when one was just minted.
        set_cookie: Option<Cookie<'static>>,
        /// Key involved, when the mechanism was an API key.
        key_id: Option<KeyId>,
    },
    /// Ask for Basic credentials.
    Challenge {
        realm: String,
        reason: FailureReason,
    },
    /// Send the browser to the login flow.
    Redirect {
        location: String,
        reason: FailureReason,
    },
    /// Denied.
    Failure {
        reason: FailureReason,
        auth_type: AuthType,
    },
}

/// Run the auth stage for one request.
pub async fn authenticate(
    state: &AppState,
    resolved: &ResolvedPolicy,
    request: &AuthRequest<'_>,
    realm: &str,
) -> AuthOutcome {
    let Some(policy) = &resolved.policy else {
        return AuthOutcome::Public;
    };

    // A presented API key wins the dispatch when the policy accepts keys.
    let key_allowed = policy.accept_api_keys || matches!(policy.scheme, AuthScheme::ApiKey);
    if key_allowed && let Some(raw_key) = api_key::extract(request.headers) {
        return match api_key::validate(
            &state.repos.keys,
            &raw_key,
            resolved.org_id,
            resolved.app_id,
        )
        .await
        {
            Ok(key) => AuthOutcome::Success {
                identity: Identity::new(key.prefix.clone(), AuthType::ApiKey),
                set_cookie: None,
                key_id: Some(key.id),
            },
            Err(reason) => AuthOutcome::Failure {
                reason,
                auth_type: AuthType::ApiKey,
            },
        };
    }

    // A live session bound to this scope short-circuits re-authentication.
    let cookie_name = &state.config.raw.session_cookie_name;
    if let Some(session) = session::from_jar(&state.repos.sessions, request.jar, cookie_name).await
        && session_covers(&session, resolved)
    {
        return AuthOutcome::Success {
            identity: session.identity,
            set_cookie: None,
            key_id: None,
        };
    }
    // A cookie that failed to validate marks an expired session rather
    // than a first visit.
    let no_session_reason = if request.jar.get(cookie_name).is_some() {
        FailureReason::ExpiredSession
    } else {
        FailureReason::MissingCredentials
    };

    match &policy.scheme {
        AuthScheme::Basic {
            username_hash,
            password_hash,
        } => {
            let Some(credentials) = basic::extract(request.headers) else {
                return AuthOutcome::Challenge {
                    realm: realm.to_owned(),
                    reason: no_session_reason,
                };
            };
            match basic::verify(&credentials, username_hash, password_hash) {
                Ok(()) => {
                    let identity = Identity::new(credentials.username, AuthType::Basic);
                    let cookie = mint_session_cookie(
                        state,
                        policy,
                        resolved,
                        identity.clone(),
                        serde_json::Value::Null,
                    )
                    .await;
                    AuthOutcome::Success {
                        identity,
                        set_cookie: cookie,
                        key_id: None,
                    }
                }
                Err(reason) => AuthOutcome::Failure {
                    reason,
                    auth_type: AuthType::Basic,
                },
            }
        }
        AuthScheme::ApiKey => AuthOutcome::Failure {
            reason: FailureReason::MissingCredentials,
            auth_type: AuthType::ApiKey,
        },
        AuthScheme::Oidc(_) => {
            let redirect = utf8_percent_encode(request.path_and_query, NON_ALPHANUMERIC);
            AuthOutcome::Redirect {
                location: format!("/__auth/login?redirect={redirect}"),
                reason: no_session_reason,
            }
        }
    }
}

/// Whether an existing session is valid for the resolved scope.
fn session_covers(session: &warren_core::AuthSession, resolved: &ResolvedPolicy) -> bool {
    match (session.app_id, resolved.app_id) {
        // App-bound sessions only cover their own app.
        (Some(bound), Some(current)) => bound == current,
        (Some(_), None) => false,
        // Org-bound sessions cover every app in the org.
        (None, _) => session.org_id.is_none() || session.org_id == resolved.org_id,
    }
}

/// Mint a session for an interactive login and build its cookie.
pub(crate) async fn mint_session_cookie(
    state: &AppState,
    policy: &AuthPolicy,
    resolved: &ResolvedPolicy,
    identity: Identity,
    claims: serde_json::Value,
) -> Option<Cookie<'static>> {
    match session::mint(
        &state.repos.sessions,
        identity,
        resolved.org_id,
        resolved.app_id,
        claims,
        policy.session_duration,
    )
    .await
    {
        Ok(minted) => Some(session::session_cookie(
            &state.config.raw.session_cookie_name,
            &minted,
            policy.session_duration,
            state.config.raw.scheme == "https",
        )),
        Err(e) => {
            // The request itself succeeded; the browser just re-auths next
            // time.
            warn!(error = %e, "session mint failed");
            None
        }
    }
}
