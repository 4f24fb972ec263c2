use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Authentication mechanism names used on audit events and in health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// No authentication enforced.
    None,
    /// HTTP Basic credentials.
    Basic,
    /// Scoped API key.
    ApiKey,
    /// OpenID Connect browser flow.
    Oidc,
    /// Account token presented by a tunnel client.
    Token,
}

impl AuthType {
    /// The canonical snake_case string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::ApiKey => "api_key",
            Self::Oidc => "oidc",
            Self::Token => "token",
        }
    }
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OIDC provider configuration carried by a policy row.
///
/// The client secret is stored only as an `ENC[AES256-GCM,...]` envelope and
/// decrypted on demand; a plaintext value in this field is a configuration
/// error, not a fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Issuer URL, e.g. `https://login.example.com`.
    pub issuer: String,

    /// OAuth client id registered with the provider.
    pub client_id: String,

    /// Encrypted OAuth client secret (`ENC[...]` envelope).
    pub client_secret_enc: String,

    /// Scopes requested on the authorization redirect.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Email domains admitted after authentication. Empty admits all.
    #[serde(default)]
    pub allowed_email_domains: Vec<String>,

    /// Claims the id-token must carry. Scalar values compare by equality;
    /// an array claim matches when it contains the required value.
    #[serde(default)]
    pub required_claims: HashMap<String, serde_json::Value>,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_owned(), "email".to_owned(), "profile".to_owned()]
}

/// The credential mechanism a policy enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    /// HTTP Basic with stored hashes. The username is a SHA-256 hex digest,
    /// the password an argon2 PHC string.
    Basic {
        username_hash: String,
        password_hash: String,
    },
    /// API keys only; no interactive credentials.
    ApiKey,
    /// OpenID Connect browser flow.
    Oidc(OidcConfig),
}

impl AuthScheme {
    /// The mechanism name for audit and health output.
    #[must_use]
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::Basic { .. } => AuthType::Basic,
            Self::ApiKey => AuthType::ApiKey,
            Self::Oidc(_) => AuthType::Oidc,
        }
    }
}

/// An auth policy row, attached either to an organization (the default for
/// every app in it) or to a single application with `auth_mode = custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// The credential mechanism.
    pub scheme: AuthScheme,

    /// Whether a valid scoped API key is accepted in addition to the
    /// primary scheme.
    #[serde(default)]
    pub accept_api_keys: bool,

    /// Lifetime of sessions minted by this policy.
    #[serde(default = "default_session_duration", with = "duration_secs")]
    pub session_duration: Duration,
}

fn default_session_duration() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Serialize `Duration` as whole seconds, matching the config surface.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_duration_round_trips_as_seconds() {
        let policy = AuthPolicy {
            scheme: AuthScheme::ApiKey,
            accept_api_keys: true,
            session_duration: Duration::from_secs(900),
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["session_duration"], 900);
        let back: AuthPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
