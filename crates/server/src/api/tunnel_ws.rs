//! The tunnel control endpoint: a WebSocket upgrade on the base domain.
//!
//! Accounts authenticate out-of-band with their bearer token before the
//! upgrade completes. Browser-originated upgrades (any `Origin` header)
//! must come from the base domain; native tunnel clients send no origin
//! and are admitted unconditionally.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use warren_audit::AuthEvent;
use warren_core::{AuthType, FailureReason, RateLimitKey};
use warren_crypto::sha256_hex;
use warren_tunnel::{FrameSink, FrameStream, TransportError};

use crate::AppState;
use crate::api::responses;
use crate::client_ip::client_ip;
use crate::ratelimit::Decision;
use crate::whitelist::allows_for_request;

/// `GET /__tunnel` — authenticate the account, then upgrade.
pub async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if !state.config.is_base_domain(host) {
        return (StatusCode::NOT_FOUND, "unknown host\n").into_response();
    }

    let addr = client_ip(peer.ip(), &headers, &state.config.trusted_proxies);

    if !origin_allowed(&state.config.raw.domain, &headers) {
        state.audit.emit(AuthEvent::failure(
            AuthType::Token,
            addr,
            FailureReason::ProtocolError,
        ));
        return (StatusCode::FORBIDDEN, "origin not allowed\n").into_response();
    }

    let now = Utc::now();
    let ip_key = RateLimitKey::ip(addr);
    if let Decision::Blocked {
        retry_after_seconds,
    } = state.limiter.check(&ip_key, now)
    {
        state.audit.emit(AuthEvent::failure(
            AuthType::Token,
            addr,
            FailureReason::RateLimited,
        ));
        return responses::rate_limited(retry_after_seconds);
    }

    // Out-of-band account token in the Authorization header.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let Some(token) = token else {
        state.audit.emit(AuthEvent::failure(
            AuthType::Token,
            addr,
            FailureReason::MissingCredentials,
        ));
        return responses::json_error(StatusCode::UNAUTHORIZED, FailureReason::MissingCredentials);
    };

    let account = match state
        .repos
        .accounts
        .validate_token(&sha256_hex(token.as_bytes()))
        .await
    {
        Ok(Some(account)) => account,
        Ok(None) => {
            state.limiter.record_failure(&ip_key, now);
            state.audit.emit(AuthEvent::failure(
                AuthType::Token,
                addr,
                FailureReason::InvalidCredentials,
            ));
            return responses::json_error(
                StatusCode::UNAUTHORIZED,
                FailureReason::InvalidCredentials,
            );
        }
        Err(e) => {
            warn!(error = %e, "account token validation failed");
            state.audit.emit(AuthEvent::failure(
                AuthType::Token,
                addr,
                FailureReason::PolicyUnavailable,
            ));
            return responses::policy_unavailable();
        }
    };

    // Tunnel-client connections do consult the account tier.
    let sets = match state
        .repos
        .whitelist
        .scoped(None, account.org_id, Some(account.id))
        .await
    {
        Ok(sets) => sets,
        Err(e) => {
            warn!(error = %e, "whitelist load failed");
            return responses::policy_unavailable();
        }
    };
    if !allows_for_request(&sets, addr, true) {
        state.audit.emit(
            AuthEvent::failure(AuthType::Token, addr, FailureReason::IpNotWhitelisted)
                .scoped(account.org_id, None)
                .with_identity(account.username.clone()),
        );
        return responses::json_error(StatusCode::FORBIDDEN, FailureReason::IpNotWhitelisted);
    }

    state.limiter.record_success(&ip_key);

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split_socket(socket);
        state
            .tunnels
            .serve_connection(Box::new(sink), Box::new(stream), account, addr)
            .await;
    })
}

/// Browser upgrades must originate from the base domain or a subdomain of
/// it; requests with no `Origin` header are non-browser clients.
fn origin_allowed(domain: &str, headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|h| h.to_str().ok()) else {
        return true;
    };
    let host = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .split('/')
        .next()
        .unwrap_or_default();
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    host.eq_ignore_ascii_case(domain)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
}

fn split_socket(socket: WebSocket) -> (WsSink, WsStream) {
    let (tx, rx) = socket.split();
    (WsSink { tx }, WsStream { rx })
}

/// Write half of the upgraded socket.
struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

/// Read half of the upgraded socket.
struct WsStream {
    rx: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.tx.send(Message::Close(None)).await;
        Ok(())
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.rx.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Close(_)) => return Ok(None),
                // The transport layer answers pings itself.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Text(_)) => {
                    debug!("text frame on tunnel socket");
                    return Err(TransportError::Io("unexpected text frame".to_owned()));
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
        Ok(None)
    }
}
