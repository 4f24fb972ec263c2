//! HTTP Basic authentication against stored hashes.
//!
//! The stored username is a SHA-256 hex digest compared in constant time;
//! the password is an argon2 PHC string. A success mints a cookie-bound
//! session so the browser is not re-challenged until it expires.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordVerifier};
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use subtle::ConstantTimeEq;

use warren_core::FailureReason;
use warren_crypto::sha256_hex;

/// Credentials pulled out of an `Authorization: Basic` header.
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Extract Basic credentials, if the header carries them.
#[must_use]
pub fn extract(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = B64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// Verify extracted credentials against the policy's stored hashes.
pub fn verify(
    credentials: &BasicCredentials,
    username_hash: &str,
    password_hash: &str,
) -> Result<(), FailureReason> {
    let candidate = sha256_hex(credentials.username.as_bytes());
    // Compare digests in constant time; both sides are fixed-length hex.
    let username_ok: bool = candidate
        .as_bytes()
        .ct_eq(username_hash.as_bytes())
        .into();

    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return Err(FailureReason::InvalidCredentials);
    };
    let password_ok = Argon2::default()
        .verify_password(credentials.password.as_bytes(), &parsed)
        .is_ok();

    if username_ok && password_ok {
        Ok(())
    } else {
        Err(FailureReason::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use argon2::password_hash::{PasswordHasher, SaltString, rand_core::OsRng};
    use axum::http::HeaderValue;

    use super::*;

    fn hash_password(password: &str) -> String {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        map
    }

    #[test]
    fn extracts_user_and_password() {
        // "u:p"
        let creds = extract(&headers_with("Basic dTpw")).unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
    }

    #[test]
    fn missing_or_malformed_header_yields_none() {
        assert!(extract(&HeaderMap::new()).is_none());
        assert!(extract(&headers_with("Bearer tok")).is_none());
        assert!(extract(&headers_with("Basic !!!not-base64")).is_none());
    }

    #[test]
    fn verify_accepts_the_right_pair_only() {
        let username_hash = sha256_hex(b"u");
        let password_hash = hash_password("p");

        let good = BasicCredentials {
            username: "u".to_owned(),
            password: "p".to_owned(),
        };
        assert!(verify(&good, &username_hash, &password_hash).is_ok());

        let wrong_pass = BasicCredentials {
            username: "u".to_owned(),
            password: "x".to_owned(),
        };
        assert_eq!(
            verify(&wrong_pass, &username_hash, &password_hash),
            Err(FailureReason::InvalidCredentials)
        );

        let wrong_user = BasicCredentials {
            username: "v".to_owned(),
            password: "p".to_owned(),
        };
        assert_eq!(
            verify(&wrong_user, &username_hash, &password_hash),
            Err(FailureReason::InvalidCredentials)
        );
    }
}
