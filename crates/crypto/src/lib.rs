//! Secret handling for Warren: AES-256-GCM envelopes for values at rest,
//! SHA-256 credential digests, and high-entropy id generation.
//!
//! Encrypted values use the envelope format
//! `ENC[AES256-GCM,data:<b64>,iv:<b64>,tag:<b64>]` so they can live in
//! configuration files and policy rows next to plain values. Decryption
//! returns [`SecretString`] to keep secrets out of logs; the [`MasterKey`]
//! zeroizes its bytes on drop.

use std::fmt;
use std::sync::LazyLock;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand_core::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// Re-export so consumers don't need a direct `secrecy` dependency.
pub use secrecy::{ExposeSecret, SecretString};

/// GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Compiled matcher for the `ENC[AES256-GCM,data:..,iv:..,tag:..]` envelope.
static ENVELOPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ENC\[AES256-GCM,data:([A-Za-z0-9+/=]+),iv:([A-Za-z0-9+/=]+),tag:([A-Za-z0-9+/=]+)\]$",
    )
    .expect("envelope regex is valid")
});

/// Errors from envelope and key operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The master key is the wrong length or encoding.
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// The envelope is malformed.
    #[error("invalid encrypted value: {0}")]
    InvalidFormat(String),

    /// Authentication failed — wrong key or corrupted data.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// A field that must be encrypted held a plaintext value.
    #[error("value is not an ENC[AES256-GCM,...] envelope; plaintext secrets are not accepted")]
    PlaintextRejected,
}

/// A 32-byte AES-256 key, zeroized on drop and redacted in Debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Parse a 32-byte master key given as 64 hex characters or base64.
pub fn parse_master_key(raw: &str) -> Result<MasterKey, CryptoError> {
    let trimmed = raw.trim();
    if trimmed.len() == 64
        && let Ok(bytes) = hex::decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    if let Ok(bytes) = B64.decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    Err(CryptoError::InvalidKey(
        "must be 32 bytes encoded as 64 hex chars or base64".to_owned(),
    ))
}

/// Whether `value` carries the `ENC[AES256-GCM,...]` envelope.
#[must_use]
pub fn is_encrypted(value: &str) -> bool {
    ENVELOPE_RE.is_match(value.trim())
}

/// Encrypt a plaintext string into an envelope suitable for storage.
pub fn encrypt_value(plaintext: &str, key: &MasterKey) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("invalid AES key: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // AES-GCM output = ciphertext || 16-byte tag
    let (data, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(format!(
        "ENC[AES256-GCM,data:{},iv:{},tag:{}]",
        B64.encode(data),
        B64.encode(nonce.as_slice()),
        B64.encode(tag),
    ))
}

fn open_envelope(value: &str, key: &MasterKey) -> Result<SecretString, CryptoError> {
    let caps = ENVELOPE_RE
        .captures(value.trim())
        .ok_or(CryptoError::PlaintextRejected)?;

    let decode = |idx: usize, what: &str| {
        B64.decode(&caps[idx])
            .map_err(|e| CryptoError::InvalidFormat(format!("invalid base64 in {what}: {e}")))
    };
    let data = decode(1, "data")?;
    let iv = decode(2, "iv")?;
    let tag = decode(3, "tag")?;

    if iv.len() != NONCE_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "IV must be {NONCE_LEN} bytes, got {}",
            iv.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "tag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }

    let mut ciphertext = data;
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("invalid AES key: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let s = String::from_utf8(plaintext)
        .map_err(|e| CryptoError::InvalidFormat(format!("decrypted value is not UTF-8: {e}")))?;
    Ok(SecretString::new(s))
}

/// Decrypt a configuration value that may or may not be enveloped.
///
/// Plain values pass through unchanged, so operators can mix encrypted and
/// plain fields in the same file.
pub fn decrypt_value(value: &str, key: &MasterKey) -> Result<SecretString, CryptoError> {
    if !is_encrypted(value) {
        return Ok(SecretString::new(value.to_owned()));
    }
    open_envelope(value, key)
}

/// Decrypt a field that MUST be encrypted, such as an OIDC client secret.
///
/// Unlike [`decrypt_value`] there is no plaintext pass-through: a plain
/// value returns [`CryptoError::PlaintextRejected`].
pub fn decrypt_secret(value: &str, key: &MasterKey) -> Result<SecretString, CryptoError> {
    open_envelope(value, key)
}

/// SHA-256 hex digest of raw credential bytes.
///
/// The persisted form of account tokens, API keys, and Basic usernames.
#[must_use]
pub fn sha256_hex(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

/// `len` bytes of OS randomness, hex-encoded.
///
/// Session ids use 32 bytes, giving the 2^-128 collision bound the session
/// contract requires.
#[must_use]
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        parse_master_key(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn envelope_round_trip() {
        let key = test_key();
        let sealed = encrypt_value("oidc-client-secret", &key).unwrap();
        assert!(is_encrypted(&sealed));
        let opened = decrypt_value(&sealed, &key).unwrap();
        assert_eq!(opened.expose_secret(), "oidc-client-secret");
    }

    #[test]
    fn plain_config_value_passes_through() {
        let key = test_key();
        let opened = decrypt_value("plain", &key).unwrap();
        assert_eq!(opened.expose_secret(), "plain");
    }

    #[test]
    fn strict_decrypt_rejects_plaintext() {
        let key = test_key();
        let err = decrypt_secret("plain-client-secret", &key).unwrap_err();
        assert!(matches!(err, CryptoError::PlaintextRejected));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = encrypt_value("secret", &test_key()).unwrap();
        let other = parse_master_key(&"cd".repeat(32)).unwrap();
        assert!(matches!(
            decrypt_secret(&sealed, &other),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn master_key_parses_hex_and_base64() {
        let from_hex = parse_master_key(&"0f".repeat(32)).unwrap();
        assert_eq!(from_hex.as_bytes(), &[0x0f; 32]);
        let from_b64 = parse_master_key(&B64.encode([0x0fu8; 32])).unwrap();
        assert_eq!(from_b64.as_bytes(), &[0x0f; 32]);
        assert!(parse_master_key("too-short").is_err());
    }

    #[test]
    fn digest_and_random_hex_shapes() {
        assert_eq!(sha256_hex(b"token").len(), 64);
        let id = random_hex(32);
        assert_eq!(id.len(), 64);
        assert_ne!(id, random_hex(32));
    }
}
