//! Process-wide configuration: TOML file, environment overrides, CLI flags.
//!
//! Validation happens once at startup; everything downstream consumes the
//! parsed forms (durations, CIDR sets, the normalized reserved-label set).
//! The JWT signing secret is required outside dev mode — session validity
//! across restarts is a correctness property, so an auto-generated key is
//! only ever accepted behind the explicit `--dev` flag.

use std::collections::HashSet;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use warren_core::parse_ip_or_cidr;
use warren_crypto::{ExposeSecret, MasterKey, SecretString, decrypt_value, random_hex};

/// Shorthand accepted in `trusted_proxies` for every private range.
const PRIVATE_RANGES_KEYWORD: &str = "private";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },

    #[error(
        "jwt_secret is required in production; set it in the config file or \
         WARREN_JWT_SECRET, or run with --dev to accept a generated key"
    )]
    MissingJwtSecret,

    #[error("secret decryption failed: {0}")]
    Crypto(#[from] warren_crypto::CryptoError),
}

/// Rate limiter tuning, configurable per deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in seconds.
    #[serde(default = "default_rl_window")]
    pub window_seconds: u64,
    /// Failures tolerated inside one window.
    #[serde(default = "default_rl_max_attempts")]
    pub max_attempts: u32,
    /// Block length once the threshold is crossed, in seconds.
    #[serde(default = "default_rl_block")]
    pub block_duration_seconds: u64,
    /// Cadence of the expired-entry sweep, in seconds.
    #[serde(default = "default_rl_sweep")]
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_rl_window(),
            max_attempts: default_rl_max_attempts(),
            block_duration_seconds: default_rl_block(),
            sweep_interval_seconds: default_rl_sweep(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

fn default_rl_window() -> u64 {
    15 * 60
}
fn default_rl_max_attempts() -> u32 {
    10
}
fn default_rl_block() -> u64 {
    30 * 60
}
fn default_rl_sweep() -> u64 {
    5 * 60
}

/// The configuration file schema.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base domain, e.g. `tunnel.example`.
    pub domain: String,

    /// `https` or `http`, used when composing public URLs.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Session/JWT signing key. May be an `ENC[...]` envelope. Required in
    /// production.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Peers whose forwarding headers are honored: addresses, CIDRs, or the
    /// `private` shorthand.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Per-request deadline for forwarded traffic, in seconds.
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_seconds: u64,

    /// Tunnel heartbeat cadence, in seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_seconds: u64,

    /// Labels that can never be claimed. Replaces the default set when set.
    #[serde(default = "default_reserved")]
    pub reserved_subdomains: Vec<String>,

    /// TTL for cached policy resolutions, in seconds.
    #[serde(default = "default_policy_ttl")]
    pub policy_cache_ttl_seconds: u64,

    /// Rate limiter tuning.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Cap on forwarded bodies in either direction.
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    /// Name of the browser session cookie.
    #[serde(default = "default_cookie_name")]
    pub session_cookie_name: String,

    /// Audit writer flush cadence, in seconds.
    #[serde(default = "default_audit_flush")]
    pub audit_flush_interval_seconds: u64,

    /// Usage roll-up cadence, in seconds.
    #[serde(default = "default_rollup")]
    pub usage_rollup_interval_seconds: u64,

    /// Grace given to live tunnels on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Accept a generated signing key and seed dev fixtures.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    8080
}
fn default_scheme() -> String {
    "https".to_owned()
}
fn default_forward_timeout() -> u64 {
    5 * 60
}
fn default_heartbeat() -> u64 {
    30
}
fn default_reserved() -> Vec<String> {
    ["admin", "api", "auth", "www", "setup", "tunnel", "static"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}
fn default_policy_ttl() -> u64 {
    60
}
fn default_max_body() -> usize {
    10 * 1024 * 1024
}
fn default_cookie_name() -> String {
    "warren_session".to_owned()
}
fn default_audit_flush() -> u64 {
    2
}
fn default_rollup() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    10
}

impl Config {
    /// Load from a TOML file, overlay environment variables, and validate.
    pub fn load(path: &str, dev_flag: bool) -> Result<ValidatedConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw)?;
        config.overlay_env();
        config.dev_mode |= dev_flag;
        config.validate()
    }

    /// Environment variables override the file for deploy-time knobs.
    fn overlay_env(&mut self) {
        if let Ok(port) = std::env::var("WARREN_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(domain) = std::env::var("WARREN_DOMAIN") {
            self.domain = domain;
        }
        if let Ok(secret) = std::env::var("WARREN_JWT_SECRET") {
            self.jwt_secret = Some(secret);
        }
    }

    /// Parse every field into its runtime form and enforce the startup
    /// invariants.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.domain.is_empty() {
            return Err(ConfigError::Invalid {
                field: "domain".to_owned(),
                message: "base domain must not be empty".to_owned(),
            });
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::Invalid {
                field: "scheme".to_owned(),
                message: format!("must be http or https, got '{}'", self.scheme),
            });
        }
        if self.reserved_subdomains.is_empty() {
            return Err(ConfigError::Invalid {
                field: "reserved_subdomains".to_owned(),
                message: "the reserved set must not be empty".to_owned(),
            });
        }

        let master_key = master_key_from_env()?;
        let jwt_secret = match &self.jwt_secret {
            Some(raw) => match &master_key {
                Some(key) => decrypt_value(raw, key)?,
                None => SecretString::new(raw.clone()),
            },
            None if self.dev_mode => {
                warn!("dev mode: using a generated signing key; sessions will not survive restarts");
                SecretString::new(random_hex(32))
            }
            None => return Err(ConfigError::MissingJwtSecret),
        };
        if jwt_secret.expose_secret().len() < 32 {
            return Err(ConfigError::Invalid {
                field: "jwt_secret".to_owned(),
                message: "must be at least 32 characters".to_owned(),
            });
        }

        let trusted_proxies = parse_trusted_proxies(&self.trusted_proxies)?;
        let reserved: HashSet<String> = self
            .reserved_subdomains
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect();

        Ok(ValidatedConfig {
            trusted_proxies,
            reserved,
            jwt_secret,
            master_key,
            raw: self,
        })
    }
}

/// Configuration after parsing and startup validation.
///
/// No `Debug`: the resolved signing secret must not reach logs through a
/// formatting shortcut.
#[derive(Clone)]
pub struct ValidatedConfig {
    /// Peers whose forwarding headers are honored.
    pub trusted_proxies: Vec<IpNet>,
    /// Normalized reserved labels.
    pub reserved: HashSet<String>,
    /// Resolved signing secret.
    pub jwt_secret: SecretString,
    /// Master key for decrypting stored secrets, when provided.
    pub master_key: Option<MasterKey>,
    /// The raw file values for everything else.
    pub raw: Config,
}

impl ValidatedConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.raw.forward_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.raw.heartbeat_interval_seconds)
    }

    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.raw.policy_cache_ttl_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.raw.shutdown_grace_seconds)
    }

    pub fn audit_flush_interval(&self) -> Duration {
        Duration::from_secs(self.raw.audit_flush_interval_seconds)
    }

    pub fn usage_rollup_interval(&self) -> Duration {
        Duration::from_secs(self.raw.usage_rollup_interval_seconds)
    }

    /// Whether `label` is in the reserved set.
    #[must_use]
    pub fn is_reserved(&self, label: &str) -> bool {
        self.reserved.contains(&label.to_lowercase())
    }

    /// The `host` header value matching the bare base domain.
    #[must_use]
    pub fn is_base_domain(&self, host: &str) -> bool {
        strip_host(host).eq_ignore_ascii_case(&self.raw.domain)
    }

    /// Extract the subdomain label from a host header, if the host is one
    /// label under the base domain. Ports and a trailing dot are ignored.
    #[must_use]
    pub fn subdomain_label<'h>(&self, host: &'h str) -> Option<&'h str> {
        let host = strip_host(host);
        if host.len() <= self.raw.domain.len() + 1 {
            return None;
        }
        let (prefix, tail) = host.split_at(host.len() - self.raw.domain.len());
        if !tail.eq_ignore_ascii_case(&self.raw.domain) {
            return None;
        }
        let label = prefix.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label)
    }
}

/// Drop an optional `:port` suffix and trailing dot from a host header.
fn strip_host(host: &str) -> &str {
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    host.strip_suffix('.').unwrap_or(host)
}

/// Read `WARREN_MASTER_KEY` when present.
fn master_key_from_env() -> Result<Option<MasterKey>, ConfigError> {
    match std::env::var("WARREN_MASTER_KEY") {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(warren_crypto::parse_master_key(&raw)?)),
        _ => Ok(None),
    }
}

/// Expand proxy config entries into CIDR sets; the `private` keyword covers
/// loopback, RFC1918, link-local, and ULA ranges.
fn parse_trusted_proxies(entries: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    let mut nets = Vec::new();
    for entry in entries {
        if entry.trim().eq_ignore_ascii_case(PRIVATE_RANGES_KEYWORD) {
            for range in [
                "127.0.0.0/8",
                "10.0.0.0/8",
                "172.16.0.0/12",
                "192.168.0.0/16",
                "169.254.0.0/16",
                "::1/128",
                "fc00::/7",
                "fe80::/10",
            ] {
                nets.push(range.parse().expect("builtin range parses"));
            }
            continue;
        }
        let net = parse_ip_or_cidr(entry).map_err(|e| ConfigError::Invalid {
            field: "trusted_proxies".to_owned(),
            message: format!("'{entry}': {e}"),
        })?;
        nets.push(net);
    }
    Ok(nets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        toml::from_str(
            r#"
            domain = "tun.example"
            jwt_secret = "0123456789abcdef0123456789abcdef"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = base_config();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit.max_attempts, 10);
        assert_eq!(config.rate_limit.window_seconds, 900);
        assert!(config.reserved_subdomains.contains(&"admin".to_owned()));
    }

    #[test]
    fn missing_jwt_secret_fails_outside_dev_mode() {
        let mut config = base_config();
        config.jwt_secret = None;
        assert!(matches!(
            config.clone().validate(),
            Err(ConfigError::MissingJwtSecret)
        ));

        config.dev_mode = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn private_keyword_expands() {
        let mut config = base_config();
        config.trusted_proxies = vec!["private".to_owned(), "203.0.113.7".to_owned()];
        let validated = config.validate().unwrap();
        assert!(validated.trusted_proxies.len() > 8);
        let addr: std::net::IpAddr = "10.1.2.3".parse().unwrap();
        assert!(validated.trusted_proxies.iter().any(|n| n.contains(&addr)));
    }

    #[test]
    fn subdomain_label_extraction() {
        let validated = base_config().validate().unwrap();
        assert_eq!(validated.subdomain_label("web.tun.example"), Some("web"));
        assert_eq!(validated.subdomain_label("Web.TUN.example"), Some("Web"));
        assert_eq!(validated.subdomain_label("tun.example"), None);
        assert_eq!(validated.subdomain_label("a.b.tun.example"), None);
        assert_eq!(validated.subdomain_label("other.example"), None);
        assert_eq!(
            validated.subdomain_label("web.tun.example:8080"),
            Some("web")
        );
        assert!(validated.is_base_domain("TUN.example"));
        assert!(validated.is_base_domain("tun.example:443"));
    }

    #[test]
    fn empty_reserved_set_is_rejected() {
        let mut config = base_config();
        config.reserved_subdomains.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "reserved_subdomains"
        ));
    }
}
