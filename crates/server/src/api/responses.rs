//! Response builders shared by the pipeline and the auth endpoints.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use warren_core::FailureReason;

use crate::quota::QuotaDenial;

/// `{"error": "<reason>"}` with the given status.
pub fn json_error(status: StatusCode, reason: FailureReason) -> Response {
    let body = serde_json::json!({ "error": reason.as_str() }).to_string();
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// 401 with the Basic challenge for this realm.
pub fn basic_challenge(realm: &str) -> Response {
    let header_value = format!("Basic realm=\"{realm}\"");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, header_value)],
        String::new(),
    )
        .into_response()
}

/// 429 with a `Retry-After` reflecting the block window.
pub fn rate_limited(retry_after_seconds: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_seconds.to_string())],
        "rate limit exceeded\n",
    )
        .into_response()
}

/// 429 with the quota header set and a human-readable body.
pub fn quota_exceeded(denial: &QuotaDenial) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        format!(
            "quota exceeded ({}); resets at {}\n",
            denial.reason, denial.reset_at
        ),
    )
        .into_response();
    let headers = response.headers_mut();
    let set = |headers: &mut axum::http::HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    set(
        headers,
        "retry-after",
        denial.retry_after_seconds.to_string(),
    );
    set(headers, "x-quota-limit", denial.limit.to_string());
    set(headers, "x-quota-used", denial.used.to_string());
    set(headers, "x-quota-remaining", denial.remaining.to_string());
    set(
        headers,
        "x-quota-reset",
        denial.reset_at.timestamp().to_string(),
    );
    response
}

/// 503 with no body: the policy layer could not decide.
pub fn policy_unavailable() -> Response {
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

/// A plain 302 redirect; browser-facing auth flows use Found, not 303/307.
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn quota_headers_are_complete() {
        let denial = QuotaDenial {
            reason: FailureReason::QuotaExceededRequests,
            limit: 1000,
            used: 1000,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after_seconds: 3600,
        };
        let response = quota_exceeded(&denial);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-quota-limit").unwrap(), "1000");
        assert_eq!(headers.get("x-quota-remaining").unwrap(), "0");
        assert_eq!(headers.get("retry-after").unwrap(), "3600");
        assert!(headers.contains_key("x-quota-reset"));
        assert!(headers.contains_key("x-quota-used"));
    }

    #[test]
    fn challenge_carries_the_realm() {
        let response = basic_challenge("docs");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("www-authenticate").unwrap(),
            "Basic realm=\"docs\""
        );
    }
}
