use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum length of a DNS label in bytes.
const MAX_LABEL_BYTES: usize = 63;

/// Errors produced when parsing a subdomain label.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubdomainError {
    /// The label was empty after normalization.
    #[error("subdomain label is empty")]
    Empty,

    /// The label exceeds the DNS limit of 63 bytes.
    #[error("subdomain label exceeds {MAX_LABEL_BYTES} bytes")]
    TooLong,

    /// The label contains a character outside `[alphanumeric-]`.
    #[error("subdomain label contains invalid character {0:?}")]
    InvalidChar(char),

    /// The label starts or ends with a hyphen.
    #[error("subdomain label starts or ends with a hyphen")]
    HyphenEdge,
}

/// The leftmost DNS label under the configured base domain; the routing key
/// for public traffic.
///
/// Labels are lowercased and Unicode-NFC normalized on construction, so two
/// `Subdomain` values compare equal exactly when they route to the same
/// tunnel. The inner string is never exposed mutably.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subdomain(String);

impl Subdomain {
    /// Parse and normalize a raw label.
    ///
    /// Normalization applies NFC then Unicode lowercasing, so registration
    /// and lookup agree regardless of the client's input form.
    pub fn parse(raw: &str) -> Result<Self, SubdomainError> {
        let normalized: String = raw.trim().nfc().flat_map(char::to_lowercase).collect();
        if normalized.is_empty() {
            return Err(SubdomainError::Empty);
        }
        if normalized.len() > MAX_LABEL_BYTES {
            return Err(SubdomainError::TooLong);
        }
        if normalized.starts_with('-') || normalized.ends_with('-') {
            return Err(SubdomainError::HyphenEdge);
        }
        if let Some(c) = normalized.chars().find(|c| !c.is_alphanumeric() && *c != '-') {
            return Err(SubdomainError::InvalidChar(c));
        }
        Ok(Self(normalized))
    }

    /// The normalized label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subdomain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
