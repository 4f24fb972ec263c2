//! Browser session minting and validation.
//!
//! Session ids are 32 bytes of OS randomness (64 hex characters); the
//! cookie carries nothing else. Cookies are HttpOnly, Secure, SameSite=Lax
//! and host-scoped to the subdomain that minted them. Tunnel-client
//! credentials never travel as cookies.

use std::sync::Arc;
use std::time::Duration;

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::Utc;

use warren_core::{AppId, AuthSession, Identity, OrgId};
use warren_store::{SessionStore, StoreError, with_busy_retry};
use warren_crypto::random_hex;

/// Mint and persist a session for an authenticated subject.
pub async fn mint(
    sessions: &Arc<dyn SessionStore>,
    identity: Identity,
    org_id: Option<OrgId>,
    app_id: Option<AppId>,
    claims: serde_json::Value,
    duration: Duration,
) -> Result<AuthSession, StoreError> {
    let now = Utc::now();
    let session = AuthSession {
        id: random_hex(32),
        identity,
        org_id,
        app_id,
        claims,
        created_at: now,
        expires_at: now + chrono::Duration::from_std(duration).unwrap_or_default(),
    };
    let stored = session.clone();
    with_busy_retry(|| {
        let sessions = Arc::clone(sessions);
        let row = stored.clone();
        async move { sessions.create(row).await }
    })
    .await?;
    Ok(session)
}

/// Look up the live session referenced by the request's cookie, if any.
pub async fn from_jar(
    sessions: &Arc<dyn SessionStore>,
    jar: &CookieJar,
    cookie_name: &str,
) -> Option<AuthSession> {
    let id = jar.get(cookie_name)?.value().to_owned();
    // A malformed id can never validate; skip the store round-trip.
    if id.len() != 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    sessions.validate(&id).await.ok().flatten()
}

/// Build the session cookie for a freshly minted session.
#[must_use]
pub fn session_cookie(
    name: &str,
    session: &AuthSession,
    duration: Duration,
    secure: bool,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_owned(), session.id.clone());
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie.set_max_age(time_duration(duration));
    cookie
}

/// A cookie that clears the session on the client.
#[must_use]
pub fn removal_cookie(name: &str) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_owned(), String::new());
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie.set_max_age(time_duration(Duration::ZERO));
    cookie
}

fn time_duration(duration: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
}

/// Background purge of expired rows.
pub async fn run_purge(
    sessions: Arc<dyn SessionStore>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sessions.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "expired sessions purged"),
                    Err(e) => tracing::warn!(error = %e, "session purge failed"),
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use warren_core::AuthType;
    use warren_store_memory::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn mint_then_validate_round_trips_identity_and_claims() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let claims = serde_json::json!({"email": "alice@acme.test"});
        let session = mint(
            &store,
            Identity::new("alice@acme.test", AuthType::Oidc),
            None,
            None,
            claims.clone(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        assert_eq!(session.id.len(), 64);
        let validated = store.validate(&session.id).await.unwrap().unwrap();
        assert_eq!(validated.identity.subject, "alice@acme.test");
        assert_eq!(validated.claims, claims);
    }

    #[tokio::test]
    async fn expired_session_does_not_validate() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let session = mint(
            &store,
            Identity::new("bob", AuthType::Basic),
            None,
            None,
            serde_json::Value::Null,
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert!(store.validate(&session.id).await.unwrap().is_none());
    }

    #[test]
    fn cookie_attributes() {
        let now = Utc::now();
        let session = AuthSession {
            id: "ab".repeat(32),
            identity: Identity::new("alice", AuthType::Basic),
            org_id: None,
            app_id: None,
            claims: serde_json::Value::Null,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        };
        let cookie = session_cookie("warren_session", &session, Duration::from_secs(3600), true);
        assert!(cookie.http_only().unwrap_or(false));
        assert!(cookie.secure().unwrap_or(false));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.value().len(), 64);
    }
}
