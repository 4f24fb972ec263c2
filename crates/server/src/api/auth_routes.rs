//! Auth endpoints served on every subdomain under `/__auth/`.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Deserialize;
use tracing::warn;

use warren_audit::AuthEvent;
use warren_core::{AuthScheme, AuthType, FailureReason, Identity, RateLimitKey, Subdomain};
use warren_crypto::decrypt_secret;

use crate::AppState;
use crate::api::responses;
use crate::auth::oidc::{
    self, LoginState, STATE_COOKIE, STATE_COOKIE_TTL, authorization_url, open_state, seal_state,
};
use crate::auth::{mint_session_cookie, session};
use crate::client_ip::client_ip;
use crate::policy::ResolvedPolicy;

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    pub redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// Resolve the subdomain and policy for an auth endpoint request.
async fn resolve_for_host(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Subdomain, ResolvedPolicy), Response> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let Some(label) = state.config.subdomain_label(host) else {
        return Err((StatusCode::NOT_FOUND, "unknown host\n").into_response());
    };
    let Ok(subdomain) = Subdomain::parse(label) else {
        return Err((StatusCode::NOT_FOUND, "invalid subdomain\n").into_response());
    };
    match state.policies.resolve(&subdomain).await {
        Ok(resolved) => Ok((subdomain, resolved)),
        Err(_) => Err(responses::policy_unavailable()),
    }
}

/// Only same-site path redirects survive; anything else becomes `/`.
fn sanitize_redirect(raw: Option<String>) -> String {
    match raw {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path,
        _ => "/".to_owned(),
    }
}

/// `GET /__auth/login?redirect=<path>` — begin the OIDC authorization.
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<RedirectQuery>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    let (subdomain, resolved) = match resolve_for_host(&state, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let Some(config) = oidc_config(&resolved) else {
        return (StatusCode::NOT_FOUND, "no login flow on this subdomain\n").into_response();
    };

    let metadata = match state.oidc.provider(&config.issuer).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(error = %e, issuer = config.issuer, "provider discovery failed");
            return responses::policy_unavailable();
        }
    };

    let login_state = LoginState::generate(sanitize_redirect(query.redirect));
    let redirect_uri = callback_uri(&state, &subdomain);
    let url = authorization_url(&metadata, config, &login_state, &redirect_uri);

    let mut cookie = Cookie::new(
        STATE_COOKIE,
        seal_state(&login_state, &state.config.jwt_secret),
    );
    cookie.set_http_only(true);
    cookie.set_secure(state.config.raw.scheme == "https");
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/__auth");
    cookie.set_max_age(time::Duration::seconds(
        i64::try_from(STATE_COOKIE_TTL.as_secs()).unwrap_or(600),
    ));

    (jar.add(cookie), responses::found(&url)).into_response()
}

/// `GET /__auth/callback` — verify state and nonce, exchange the code,
/// mint the session.
pub async fn callback(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<CallbackQuery>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    let (subdomain, resolved) = match resolve_for_host(&state, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let Some(policy) = resolved.policy.clone() else {
        return (StatusCode::NOT_FOUND, "no login flow on this subdomain\n").into_response();
    };
    let AuthScheme::Oidc(config) = &policy.scheme else {
        return (StatusCode::NOT_FOUND, "no login flow on this subdomain\n").into_response();
    };

    let addr = client_ip(peer.ip(), &headers, &state.config.trusted_proxies);
    let deny = |reason: FailureReason| {
        state.audit.emit(
            AuthEvent::failure(AuthType::Oidc, addr, reason)
                .scoped(resolved.org_id, resolved.app_id),
        );
        if reason == FailureReason::InvalidCredentials {
            let now = chrono::Utc::now();
            state.limiter.record_failure(&RateLimitKey::ip(addr), now);
            if let Some(app) = resolved.app_id {
                state
                    .limiter
                    .record_failure(&RateLimitKey::app_ip(app, addr), now);
            }
        }
        let status = match reason {
            FailureReason::DomainNotAllowed | FailureReason::ClaimMismatch => {
                StatusCode::FORBIDDEN
            }
            FailureReason::PolicyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        };
        responses::json_error(status, reason)
    };

    // State and nonce come from the sealed HttpOnly cookie; a mismatch is
    // a credential failure, never another redirect.
    let (Some(code), Some(echoed_state)) = (query.code, query.state) else {
        return deny(FailureReason::InvalidCredentials);
    };
    let Some(login_state) = jar
        .get(STATE_COOKIE)
        .and_then(|cookie| open_state(cookie.value(), &state.config.jwt_secret))
    else {
        return deny(FailureReason::InvalidCredentials);
    };
    if login_state.state != echoed_state {
        return deny(FailureReason::InvalidCredentials);
    }

    // The client secret is stored encrypted; plaintext is rejected.
    let Some(master_key) = &state.config.master_key else {
        warn!("OIDC policy present but no WARREN_MASTER_KEY configured");
        return deny(FailureReason::PolicyUnavailable);
    };
    let client_secret = match decrypt_secret(&config.client_secret_enc, master_key) {
        Ok(secret) => secret,
        Err(e) => {
            warn!(error = %e, "client secret decryption failed");
            return deny(FailureReason::PolicyUnavailable);
        }
    };

    let metadata = match state.oidc.provider(&config.issuer).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(error = %e, issuer = config.issuer, "provider discovery failed");
            return deny(FailureReason::PolicyUnavailable);
        }
    };

    let redirect_uri = callback_uri(&state, &subdomain);
    let id_token = match state
        .oidc
        .exchange_code(
            &metadata.token_endpoint,
            config,
            &client_secret,
            &code,
            &login_state.verifier,
            &redirect_uri,
        )
        .await
    {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "code exchange failed");
            return deny(FailureReason::InvalidCredentials);
        }
    };

    let claims = match oidc::verify_id_token(&id_token, &metadata, config, &login_state.nonce) {
        Ok(claims) => claims,
        Err(reason) => return deny(reason),
    };
    let email = match oidc::check_email_domain(&claims, &config.allowed_email_domains) {
        Ok(email) => email,
        Err(reason) => return deny(reason),
    };
    if let Err(reason) = oidc::check_required_claims(&claims, &config.required_claims) {
        return deny(reason);
    }

    let identity = Identity::new(email, AuthType::Oidc);
    state.audit.emit(
        AuthEvent::success(AuthType::Oidc, addr)
            .scoped(resolved.org_id, resolved.app_id)
            .with_identity(identity.subject.clone()),
    );
    let session_cookie =
        mint_session_cookie(&state, &policy, &resolved, identity, claims).await;

    let mut state_removal = Cookie::from(STATE_COOKIE);
    state_removal.set_path("/__auth");
    let mut jar = jar.remove(state_removal);
    if let Some(cookie) = session_cookie {
        jar = jar.add(cookie);
    }
    (jar, responses::found(&login_state.redirect)).into_response()
}

/// `GET /__auth/logout?redirect=<path>` — destroy the session.
pub async fn logout(
    State(state): State<AppState>,
    Query(query): Query<RedirectQuery>,
    jar: CookieJar,
) -> Response {
    let cookie_name = state.config.raw.session_cookie_name.clone();
    if let Some(cookie) = jar.get(&cookie_name) {
        let id = cookie.value().to_owned();
        if let Err(e) = state.repos.sessions.delete(&id).await {
            warn!(error = %e, "session delete failed");
        }
    }
    let jar = jar.add(session::removal_cookie(&cookie_name));
    (jar, responses::found(&sanitize_redirect(query.redirect))).into_response()
}

/// `GET /__auth/health` — subdomain, resolved auth mode, org-policy
/// presence.
pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (subdomain, resolved) = match resolve_for_host(&state, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let auth_mode = resolved
        .auth_mode
        .map_or("ephemeral", |mode| match mode {
            warren_core::AuthMode::Inherit => "inherit",
            warren_core::AuthMode::Disabled => "disabled",
            warren_core::AuthMode::Custom => "custom",
        });
    let effective = resolved
        .policy
        .as_ref()
        .map_or(AuthType::None, |p| p.scheme.auth_type());
    let body = serde_json::json!({
        "status": "ok",
        "subdomain": subdomain.as_str(),
        "auth_mode": auth_mode,
        "effective_auth": effective.as_str(),
        "org_policy": resolved.org_has_policy,
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn oidc_config(resolved: &ResolvedPolicy) -> Option<&warren_core::OidcConfig> {
    match resolved.policy.as_ref()?.scheme {
        AuthScheme::Oidc(ref config) => Some(config),
        _ => None,
    }
}

fn callback_uri(state: &AppState, subdomain: &Subdomain) -> String {
    format!(
        "{}://{}.{}/__auth/callback",
        state.config.raw.scheme, subdomain, state.config.raw.domain
    )
}
