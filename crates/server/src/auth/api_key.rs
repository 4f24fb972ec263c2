//! Scoped API-key validation.
//!
//! Keys arrive in `Authorization: Bearer`, `X-API-Key`, or
//! `X-Tunnel-API-Key`; only the SHA-256 hex digest is ever compared. A key
//! must be unexpired and its `(org, app?)` scope must cover the request.
//! API-key clients never receive a challenge — failures are a 401 JSON
//! envelope.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;

use warren_core::{ApiKey, AppId, FailureReason, OrgId};
use warren_crypto::sha256_hex;
use warren_store::ApiKeyStore;

/// Pull a raw key out of the accepted headers, in precedence order.
#[must_use]
pub fn extract(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_owned());
    }
    for name in ["x-api-key", "x-tunnel-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(value) = value.to_str()
        {
            return Some(value.trim().to_owned());
        }
    }
    None
}

/// Validate a raw key against the store and the request's resolved scope.
///
/// On success the key's `last_used_at` is stamped (best effort).
pub async fn validate(
    keys: &Arc<dyn ApiKeyStore>,
    raw_key: &str,
    org_id: Option<OrgId>,
    app_id: Option<AppId>,
) -> Result<ApiKey, FailureReason> {
    let hash = sha256_hex(raw_key.as_bytes());
    let key = keys
        .validate(&hash)
        .await
        .map_err(|_| FailureReason::PolicyUnavailable)?
        .ok_or(FailureReason::UnknownKey)?;

    let now = Utc::now();
    if key.is_expired(now) {
        return Err(FailureReason::ExpiredCredentials);
    }

    // Scope: the request must have resolved to the key's organization.
    let Some(org_id) = org_id else {
        return Err(FailureReason::ScopeMismatch);
    };
    if !key.covers(org_id, app_id) {
        return Err(FailureReason::ScopeMismatch);
    }

    if let Err(e) = keys.touch_last_used(key.id, now).await {
        tracing::debug!(error = %e, key = %key.id, "last-used stamp failed");
    }
    Ok(key)
}
