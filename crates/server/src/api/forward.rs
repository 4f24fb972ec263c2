//! The single chokepoint for public HTTP that will be forwarded.
//!
//! Order is fixed and fail-closed: subdomain from host, rate-limit
//! pre-check, client-IP extraction, whitelist gate, policy load, auth
//! handler, rate-limit post-record, quota gate, forward. Every decision
//! point emits exactly one audit event with a reason from the closed
//! taxonomy.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use bytes::Bytes;
use chrono::Utc;
use tracing::debug;

use warren_audit::AuthEvent;
use warren_core::{AuthType, FailureReason, RateLimitKey, Subdomain};
use warren_tunnel::{ForwardError, ForwardRequest, ForwardResponse, HeaderSet};

use crate::AppState;
use crate::api::responses;
use crate::auth::{self, AuthOutcome, AuthRequest};
use crate::client_ip::client_ip;
use crate::ratelimit::Decision;
use crate::whitelist::allows_for_request;

/// Headers that never cross the tunnel in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Fallback handler: everything that is not an auth endpoint or the tunnel
/// upgrade.
pub async fn handle_public(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| "/".to_owned(), |pq| pq.as_str().to_owned());

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if state.config.is_base_domain(host) {
        return base_domain_response(&path_and_query);
    }
    let Some(label) = state.config.subdomain_label(host) else {
        return (StatusCode::NOT_FOUND, "unknown host\n").into_response();
    };
    // Reserved labels are never forwarded, whatever is registered.
    if state.config.is_reserved(label) {
        return (StatusCode::NOT_FOUND, "reserved subdomain\n").into_response();
    }
    let Ok(subdomain) = Subdomain::parse(label) else {
        return (StatusCode::NOT_FOUND, "invalid subdomain\n").into_response();
    };

    let addr = client_ip(peer.ip(), &headers, &state.config.trusted_proxies);
    let now = Utc::now();

    // Rate-limit pre-check on the bare address.
    let ip_key = RateLimitKey::ip(addr);
    if let Decision::Blocked {
        retry_after_seconds,
    } = state.limiter.check(&ip_key, now)
    {
        state.audit.emit(AuthEvent::failure(
            AuthType::None,
            addr,
            FailureReason::RateLimited,
        ));
        return responses::rate_limited(retry_after_seconds);
    }

    // Policy load; a store fault is an explicit deny.
    let resolved = match state.policies.resolve(&subdomain).await {
        Ok(resolved) => resolved,
        Err(_) => {
            state.audit.emit(AuthEvent::failure(
                AuthType::None,
                addr,
                FailureReason::PolicyUnavailable,
            ));
            return responses::policy_unavailable();
        }
    };

    // Second rate-limit key once the app is known.
    let app_key = resolved.app_id.map(|app| RateLimitKey::app_ip(app, addr));
    if let Some(key) = &app_key
        && let Decision::Blocked {
            retry_after_seconds,
        } = state.limiter.check(key, now)
    {
        state.audit.emit(
            AuthEvent::failure(AuthType::None, addr, FailureReason::RateLimited)
                .scoped(resolved.org_id, resolved.app_id),
        );
        return responses::rate_limited(retry_after_seconds);
    }

    // Whitelist gate. Public requests never consult the account tier.
    let sets = match state
        .repos
        .whitelist
        .scoped(resolved.app_id, resolved.org_id, None)
        .await
    {
        Ok(sets) => sets,
        Err(e) => {
            debug!(error = %e, "whitelist load failed");
            state.audit.emit(
                AuthEvent::failure(AuthType::None, addr, FailureReason::PolicyUnavailable)
                    .scoped(resolved.org_id, resolved.app_id),
            );
            return responses::policy_unavailable();
        }
    };
    if !allows_for_request(&sets, addr, false) {
        state.audit.emit(
            AuthEvent::failure(AuthType::None, addr, FailureReason::IpNotWhitelisted)
                .scoped(resolved.org_id, resolved.app_id),
        );
        return responses::json_error(StatusCode::FORBIDDEN, FailureReason::IpNotWhitelisted);
    }

    // Auth handler dispatch.
    let auth_request = AuthRequest {
        headers: &headers,
        jar: &jar,
        path_and_query: &path_and_query,
        client_ip: addr,
    };
    let set_cookie =
        match auth::authenticate(&state, &resolved, &auth_request, subdomain.as_str()).await {
            AuthOutcome::Public => {
                state.audit.emit(
                    AuthEvent::success(AuthType::None, addr)
                        .scoped(resolved.org_id, resolved.app_id),
                );
                None
            }
            AuthOutcome::Success {
                identity,
                set_cookie,
                key_id,
            } => {
                state.limiter.record_success(&ip_key);
                if let Some(key) = &app_key {
                    state.limiter.record_success(key);
                }
                let mut event = AuthEvent::success(identity.auth_type, addr)
                    .scoped(resolved.org_id, resolved.app_id)
                    .with_identity(identity.subject);
                if let Some(key_id) = key_id {
                    event = event.with_key(key_id);
                }
                state.audit.emit(event);
                set_cookie
            }
            AuthOutcome::Challenge { realm, reason } => {
                state.audit.emit(
                    AuthEvent::failure(AuthType::Basic, addr, reason)
                        .scoped(resolved.org_id, resolved.app_id),
                );
                return responses::basic_challenge(&realm);
            }
            AuthOutcome::Redirect { location, reason } => {
                state.audit.emit(
                    AuthEvent::failure(AuthType::Oidc, addr, reason)
                        .scoped(resolved.org_id, resolved.app_id),
                );
                return responses::found(&location);
            }
            AuthOutcome::Failure { reason, auth_type } => {
                if reason == FailureReason::InvalidCredentials {
                    state.limiter.record_failure(&ip_key, now);
                    if let Some(key) = &app_key {
                        state.limiter.record_failure(key, now);
                    }
                }
                state.audit.emit(
                    AuthEvent::failure(auth_type, addr, reason)
                        .scoped(resolved.org_id, resolved.app_id),
                );
                return auth_failure_response(auth_type, reason, subdomain.as_str());
            }
        };

    // Read the body before the quota gate so the projection is exact.
    let body = match axum::body::to_bytes(request.into_body(), state.config.raw.max_body_bytes)
        .await
    {
        Ok(body) => body,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large\n").into_response();
        }
    };

    // Quota gate: no HTTP_REQ is ever emitted for an over-quota org. For
    // an ephemeral subdomain the accountable org comes from the live
    // claim rather than the policy resolution.
    let usage_org = resolved
        .org_id
        .or_else(|| state.tunnels.claim_org(&subdomain));
    if let Some(org) = usage_org
        && let Err(denial) = state.quota.check_request(org, body.len() as u64).await
    {
        state.audit.emit(
            AuthEvent::failure(AuthType::None, addr, denial.reason)
                .scoped(resolved.org_id, resolved.app_id),
        );
        return responses::quota_exceeded(&denial);
    }

    // Forward and relay.
    let request_bytes = body.len() as u64;
    let forward = ForwardRequest {
        method: method.to_string(),
        path_and_query: path_and_query.clone(),
        headers: wire_headers(&headers, addr, &state.config.raw.scheme, host),
        body,
    };
    match state.tunnels.forward(&subdomain, forward).await {
        Ok(response) => {
            if let Some(org) = usage_org {
                let total = request_bytes + response.body.len() as u64;
                state.quota.record_request(org, total).await;
            }
            relay_response(response, set_cookie)
        }
        Err(ForwardError::NoTunnel) => {
            state.audit.emit(
                AuthEvent::failure(AuthType::None, addr, FailureReason::NoTunnel)
                    .scoped(resolved.org_id, resolved.app_id),
            );
            (StatusCode::NOT_FOUND, "no tunnel is attached to this subdomain\n").into_response()
        }
        Err(ForwardError::Timeout | ForwardError::Closed) => {
            state.audit.emit(
                AuthEvent::failure(AuthType::None, addr, FailureReason::TunnelTimeout)
                    .scoped(resolved.org_id, resolved.app_id),
            );
            (StatusCode::GATEWAY_TIMEOUT, "tunnel timeout\n").into_response()
        }
        Err(ForwardError::Upstream(kind)) => {
            // Equivalent to a 502 with the diagnostic body suppressed.
            debug!(kind = %kind, "upstream error reported by tunnel client");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Requests addressed to the base domain itself belong to the admin/UI
/// collaborator; the core serves a placeholder.
fn base_domain_response(path: &str) -> Response {
    if path == "/" {
        (StatusCode::OK, "warren tunnel service\n").into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Map an auth failure onto the per-mechanism response shape.
fn auth_failure_response(auth_type: AuthType, reason: FailureReason, realm: &str) -> Response {
    match auth_type {
        // Basic clients are re-challenged alongside the failure.
        AuthType::Basic => responses::basic_challenge(realm),
        // API-key clients never see a challenge, only the JSON envelope.
        AuthType::ApiKey => responses::json_error(StatusCode::UNAUTHORIZED, reason),
        _ => match reason {
            FailureReason::DomainNotAllowed | FailureReason::ClaimMismatch => {
                responses::json_error(StatusCode::FORBIDDEN, reason)
            }
            _ => responses::json_error(StatusCode::UNAUTHORIZED, reason),
        },
    }
}

/// Request headers as they cross the tunnel: hop-by-hop headers dropped,
/// forwarding metadata appended.
fn wire_headers(headers: &HeaderMap, addr: std::net::IpAddr, scheme: &str, host: &str) -> HeaderSet {
    let mut wire: HeaderSet = headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter(|(name, _)| name.as_str() != "x-forwarded-for")
        .map(|(name, value)| {
            (
                Bytes::copy_from_slice(name.as_str().as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect();

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {addr}"),
        None => addr.to_string(),
    };
    wire.push((
        Bytes::from_static(b"x-forwarded-for"),
        Bytes::from(forwarded_for),
    ));
    wire.push((
        Bytes::from_static(b"x-forwarded-proto"),
        Bytes::copy_from_slice(scheme.as_bytes()),
    ));
    wire.push((
        Bytes::from_static(b"x-forwarded-host"),
        Bytes::copy_from_slice(host.as_bytes()),
    ));
    wire
}

/// Build the public response from the tunnel reply.
fn relay_response(
    response: ForwardResponse,
    set_cookie: Option<axum_extra::extract::cookie::Cookie<'static>>,
) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::builder().status(status);
    if let Some(headers) = out.headers_mut() {
        for (name, value) in &response.headers {
            let Ok(name) = HeaderName::from_bytes(name) else {
                continue;
            };
            if HOP_BY_HOP.contains(&name.as_str()) || name == header::CONTENT_LENGTH {
                continue;
            }
            let Ok(value) = HeaderValue::from_bytes(value) else {
                continue;
            };
            headers.append(name, value);
        }
        if let Some(cookie) = set_cookie
            && let Ok(value) = HeaderValue::from_str(&cookie.to_string())
        {
            headers.append(header::SET_COOKIE, value);
        }
    }
    out.body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
