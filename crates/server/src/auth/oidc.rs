//! OpenID Connect browser flow.
//!
//! The shared cache holds issuer-level metadata only (endpoints and JWKS);
//! per-request authorization parameters — including the subdomain-specific
//! redirect URL — are built as plain values, so nothing on the request path
//! mutates cached state. State, nonce, and the PKCE verifier travel in an
//! HttpOnly cookie sealed with an HMAC over the signing secret; a
//! mismatched state or nonce is `invalid_credentials`, never a retry loop.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use warren_core::{FailureReason, OidcConfig};
use warren_crypto::{ExposeSecret, SecretString, random_hex};

type HmacSha256 = Hmac<Sha256>;

/// How long issuer metadata and JWKS stay cached.
const PROVIDER_TTL: Duration = Duration::from_secs(3600);

/// Lifetime of the state cookie: the window a user has to finish logging in.
pub const STATE_COOKIE_TTL: Duration = Duration::from_secs(600);

/// Name of the state cookie.
pub const STATE_COOKIE: &str = "warren_oidc_state";

/// Errors talking to the provider. Callers map these onto the closed
/// failure taxonomy before anything user-visible happens.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),
}

/// OpenID Connect discovery document, reduced to what the flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// One JSON Web Key from the provider's set.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// Issuer-level metadata held in the shared cache.
#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub keys: Vec<Jwk>,
}

/// Fetches and caches provider metadata; exchanges authorization codes.
pub struct OidcClient {
    http: reqwest::Client,
    providers: Cache<String, Arc<ProviderMetadata>>,
}

impl Default for OidcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OidcClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            providers: Cache::builder()
                .max_capacity(64)
                .time_to_live(PROVIDER_TTL)
                .build(),
        }
    }

    /// Issuer metadata, fetched once per TTL.
    pub async fn provider(&self, issuer: &str) -> Result<Arc<ProviderMetadata>, OidcError> {
        let issuer = issuer.trim_end_matches('/').to_owned();
        let http = self.http.clone();
        self.providers
            .try_get_with(issuer.clone(), async move {
                let url = format!("{issuer}/.well-known/openid-configuration");
                debug!(%url, "fetching OIDC discovery document");
                let discovery: DiscoveryDocument = http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| OidcError::Discovery(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| OidcError::Discovery(e.to_string()))?
                    .json()
                    .await
                    .map_err(|e| OidcError::Discovery(e.to_string()))?;

                let jwks: JwkSet = http
                    .get(&discovery.jwks_uri)
                    .send()
                    .await
                    .map_err(|e| OidcError::Discovery(e.to_string()))?
                    .json()
                    .await
                    .map_err(|e| OidcError::Discovery(e.to_string()))?;

                Ok::<_, OidcError>(Arc::new(ProviderMetadata {
                    authorization_endpoint: discovery.authorization_endpoint,
                    token_endpoint: discovery.token_endpoint,
                    keys: jwks.keys,
                }))
            })
            .await
            .map_err(|e: Arc<OidcError>| OidcError::Discovery(e.to_string()))
    }

    /// Exchange an authorization code (with its PKCE verifier) for an
    /// id-token.
    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        config: &OidcConfig,
        client_secret: &SecretString,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<String, OidcError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            id_token: Option<String>,
        }

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &config.client_id),
            ("client_secret", client_secret.expose_secret()),
            ("code_verifier", verifier),
        ];
        let response: TokenResponse = self
            .http
            .post(token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| OidcError::Exchange(e.to_string()))?
            .error_for_status()
            .map_err(|e| OidcError::Exchange(e.to_string()))?
            .json()
            .await
            .map_err(|e| OidcError::Exchange(e.to_string()))?;

        response
            .id_token
            .ok_or_else(|| OidcError::Exchange("token response carried no id_token".to_owned()))
    }
}

/// Contents of the sealed state cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginState {
    /// Anti-CSRF state echoed by the provider.
    pub state: String,
    /// Nonce the id-token must carry.
    pub nonce: String,
    /// PKCE code verifier.
    pub verifier: String,
    /// Where to send the browser after login.
    pub redirect: String,
}

impl LoginState {
    /// Fresh random state for a new login.
    #[must_use]
    pub fn generate(redirect: String) -> Self {
        Self {
            state: random_hex(16),
            nonce: random_hex(16),
            verifier: random_hex(32),
            redirect,
        }
    }

    /// The S256 code challenge for this verifier.
    #[must_use]
    pub fn code_challenge(&self) -> String {
        let digest = Sha256::digest(self.verifier.as_bytes());
        B64URL.encode(digest)
    }
}

/// Seal the login state into a cookie value: `payload.signature`.
#[must_use]
pub fn seal_state(state: &LoginState, secret: &SecretString) -> String {
    let payload = B64URL.encode(serde_json::to_vec(state).expect("state serializes"));
    let sig = sign(payload.as_bytes(), secret);
    format!("{payload}.{sig}")
}

/// Open and verify a sealed state cookie value.
#[must_use]
pub fn open_state(value: &str, secret: &SecretString) -> Option<LoginState> {
    let (payload, sig) = value.rsplit_once('.')?;
    // The mac's own verify runs in constant time.
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    let given = hex::decode(sig).ok()?;
    mac.verify_slice(&given).ok()?;

    let raw = B64URL.decode(payload).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn sign(payload: &[u8], secret: &SecretString) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Build the provider authorization URL for one login.
#[must_use]
pub fn authorization_url(
    metadata: &ProviderMetadata,
    config: &OidcConfig,
    login: &LoginState,
    redirect_uri: &str,
) -> String {
    use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
    let encode = |s: &str| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string();

    let scope = config.scopes.join(" ");
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&nonce={}&code_challenge={}&code_challenge_method=S256",
        metadata.authorization_endpoint,
        encode(&config.client_id),
        encode(redirect_uri),
        encode(&scope),
        encode(&login.state),
        encode(&login.nonce),
        encode(&login.code_challenge()),
    )
}

/// Verify an id-token's signature and standard claims, returning the claim
/// set.
pub fn verify_id_token(
    id_token: &str,
    metadata: &ProviderMetadata,
    config: &OidcConfig,
    expected_nonce: &str,
) -> Result<serde_json::Value, FailureReason> {
    let header = decode_header(id_token).map_err(|_| FailureReason::InvalidCredentials)?;
    if header.alg != Algorithm::RS256 {
        warn!(alg = ?header.alg, "unsupported id-token algorithm");
        return Err(FailureReason::InvalidCredentials);
    }

    let key = select_key(&metadata.keys, header.kid.as_deref())
        .ok_or(FailureReason::InvalidCredentials)?;
    let (Some(n), Some(e)) = (key.n.as_deref(), key.e.as_deref()) else {
        return Err(FailureReason::InvalidCredentials);
    };
    let decoding_key =
        DecodingKey::from_rsa_components(n, e).map_err(|_| FailureReason::InvalidCredentials)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[&config.client_id]);
    validation.set_issuer(&[config.issuer.trim_end_matches('/')]);

    let data = decode::<serde_json::Value>(id_token, &decoding_key, &validation)
        .map_err(|e| {
            debug!(error = %e, "id-token verification failed");
            FailureReason::InvalidCredentials
        })?;

    let claims = data.claims;
    if claims.get("nonce").and_then(serde_json::Value::as_str) != Some(expected_nonce) {
        return Err(FailureReason::InvalidCredentials);
    }
    Ok(claims)
}

fn select_key<'k>(keys: &'k [Jwk], kid: Option<&str>) -> Option<&'k Jwk> {
    let mut rsa = keys.iter().filter(|k| k.kty == "RSA");
    match kid {
        Some(kid) => rsa.find(|k| k.kid.as_deref() == Some(kid)),
        // No kid in the header: only unambiguous with a single RSA key.
        None => {
            let first = rsa.next()?;
            rsa.next().is_none().then_some(first)
        }
    }
}

/// Enforce the allowed-email-domain list. An empty list admits every
/// domain. Returns the email for the session subject.
pub fn check_email_domain(
    claims: &serde_json::Value,
    allowed: &[String],
) -> Result<String, FailureReason> {
    let email = claims
        .get("email")
        .and_then(serde_json::Value::as_str)
        .ok_or(FailureReason::ClaimMismatch)?;
    if allowed.is_empty() {
        return Ok(email.to_owned());
    }
    let domain = email
        .rsplit_once('@')
        .map(|(_, d)| d)
        .ok_or(FailureReason::DomainNotAllowed)?;
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(domain)) {
        Ok(email.to_owned())
    } else {
        Err(FailureReason::DomainNotAllowed)
    }
}

/// Enforce required claims: scalar values compare by equality, array
/// claims match when they contain the required value.
pub fn check_required_claims(
    claims: &serde_json::Value,
    required: &std::collections::HashMap<String, serde_json::Value>,
) -> Result<(), FailureReason> {
    for (name, expected) in required {
        let Some(actual) = claims.get(name) else {
            return Err(FailureReason::ClaimMismatch);
        };
        let matches = match actual {
            serde_json::Value::Array(values) => values.contains(expected),
            scalar => scalar == expected,
        };
        if !matches {
            return Err(FailureReason::ClaimMismatch);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn secret() -> SecretString {
        SecretString::new("0123456789abcdef0123456789abcdef".to_owned())
    }

    #[test]
    fn state_cookie_seals_and_opens() {
        let login = LoginState::generate("/dashboard".to_owned());
        let sealed = seal_state(&login, &secret());
        let opened = open_state(&sealed, &secret()).unwrap();
        assert_eq!(opened, login);
    }

    #[test]
    fn tampered_state_cookie_is_rejected() {
        let login = LoginState::generate("/".to_owned());
        let sealed = seal_state(&login, &secret());

        let mut forged = sealed.clone();
        forged.replace_range(0..1, if sealed.starts_with('A') { "B" } else { "A" });
        assert!(open_state(&forged, &secret()).is_none());

        let other = SecretString::new("another-secret-another-secret-00".to_owned());
        assert!(open_state(&sealed, &other).is_none());
    }

    #[test]
    fn code_challenge_is_s256_of_the_verifier() {
        let login = LoginState::generate("/".to_owned());
        let expected = B64URL.encode(Sha256::digest(login.verifier.as_bytes()));
        assert_eq!(login.code_challenge(), expected);
    }

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let metadata = ProviderMetadata {
            authorization_endpoint: "https://idp.test/authorize".to_owned(),
            token_endpoint: "https://idp.test/token".to_owned(),
            keys: vec![],
        };
        let config = OidcConfig {
            issuer: "https://idp.test".to_owned(),
            client_id: "client-1".to_owned(),
            client_secret_enc: String::new(),
            scopes: vec!["openid".to_owned(), "email".to_owned()],
            allowed_email_domains: vec![],
            required_claims: HashMap::new(),
        };
        let login = LoginState::generate("/".to_owned());
        let url = authorization_url(
            &metadata,
            &config,
            &login,
            "https://app1.tun.example/__auth/callback",
        );
        assert!(url.starts_with("https://idp.test/authorize?response_type=code"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", login.state)));
        assert!(url.contains("scope=openid%20email"));
    }

    #[test]
    fn email_domain_gate() {
        let claims = serde_json::json!({"email": "alice@other.test"});
        let allowed = vec!["acme.test".to_owned()];
        assert_eq!(
            check_email_domain(&claims, &allowed),
            Err(FailureReason::DomainNotAllowed)
        );

        let ok = serde_json::json!({"email": "alice@ACME.test"});
        assert_eq!(
            check_email_domain(&ok, &allowed).unwrap(),
            "alice@ACME.test"
        );

        // Empty allow-list admits everything with an email claim.
        assert!(check_email_domain(&claims, &[]).is_ok());
        assert_eq!(
            check_email_domain(&serde_json::json!({}), &allowed),
            Err(FailureReason::ClaimMismatch)
        );
    }

    #[test]
    fn required_claims_scalar_and_array_membership() {
        let claims = serde_json::json!({
            "hd": "acme.test",
            "groups": ["eng", "ops"],
        });

        let mut required = HashMap::new();
        required.insert("hd".to_owned(), serde_json::json!("acme.test"));
        required.insert("groups".to_owned(), serde_json::json!("eng"));
        assert!(check_required_claims(&claims, &required).is_ok());

        required.insert("groups".to_owned(), serde_json::json!("sales"));
        assert_eq!(
            check_required_claims(&claims, &required),
            Err(FailureReason::ClaimMismatch)
        );

        let mut missing = HashMap::new();
        missing.insert("dept".to_owned(), serde_json::json!("eng"));
        assert_eq!(
            check_required_claims(&claims, &missing),
            Err(FailureReason::ClaimMismatch)
        );
    }
}
