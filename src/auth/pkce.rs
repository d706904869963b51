//! PKCE (Proof Key for Code Exchange) implementation.
//!
//! RFC 7636: <https://datatracker.ietf.org/doc/html/rfc7636>

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Unreserved URI characters (RFC 3986 section 2.3), the verifier alphabet.
pub const UNRESERVED_ALPHABET: &[u8; 66] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Shortest verifier RFC 7636 allows.
pub const MIN_VERIFIER_LEN: usize = 43;
/// Longest verifier RFC 7636 allows.
pub const MAX_VERIFIER_LEN: usize = 128;
/// Verifier length used when none is configured.
pub const DEFAULT_VERIFIER_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum PkceError {
    #[error("Verifier length {0} outside {MIN_VERIFIER_LEN}..={MAX_VERIFIER_LEN}")]
    InvalidLength(usize),

    #[error("Verifier contains a character outside the unreserved set: {0:?}")]
    InvalidCharacter(char),

    #[error("Secure random source unavailable: {0}")]
    SecureRandomUnavailable(String),
}

/// A PKCE code verifier.
///
/// Only lives for one authorization round-trip: created before the redirect,
/// sent once at token exchange, then discarded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Verifier(String);

impl Verifier {
    /// Validate an existing verifier string (e.g. one read back from storage).
    pub fn parse(value: impl Into<String>) -> Result<Self, PkceError> {
        let value = value.into();
        if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&value.len()) {
            return Err(PkceError::InvalidLength(value.len()));
        }
        if let Some(c) = value
            .chars()
            .find(|c| !c.is_ascii() || !UNRESERVED_ALPHABET.contains(&(*c as u8)))
        {
            return Err(PkceError::InvalidCharacter(c));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Challenge derived from this verifier.
    #[must_use]
    pub fn challenge(&self) -> Challenge {
        derive_challenge(&self.0)
    }
}

// Keep the secret out of logs and panic messages.
impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Verifier(<{} chars>)", self.0.len())
    }
}

impl TryFrom<String> for Verifier {
    type Error = PkceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Verifier> for String {
    fn from(verifier: Verifier) -> Self {
        verifier.0
    }
}

/// A PKCE `S256` code challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge(String);

impl Challenge {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a random verifier of `length` characters.
///
/// Each byte from the OS random source is mapped modulo 66 onto the
/// unreserved alphabet. Since 256 is not a multiple of 66 the first 58
/// characters are slightly more likely; only the byte source is uniform.
pub fn generate_verifier(length: usize) -> Result<Verifier, PkceError> {
    if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&length) {
        return Err(PkceError::InvalidLength(length));
    }

    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| PkceError::SecureRandomUnavailable(e.to_string()))?;

    let verifier = bytes
        .iter()
        .map(|b| char::from(UNRESERVED_ALPHABET[usize::from(*b) % UNRESERVED_ALPHABET.len()]))
        .collect();

    Ok(Verifier(verifier))
}

/// `base64url(SHA-256(verifier))` without padding.
#[must_use]
pub fn derive_challenge(verifier: &str) -> Challenge {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    Challenge(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub verifier: Verifier,
    pub challenge: Challenge,
}

impl PkceCodes {
    /// Generate a new pair with the default verifier length.
    pub fn generate() -> Result<Self, PkceError> {
        Self::with_length(DEFAULT_VERIFIER_LEN)
    }

    /// Generate a new pair with a verifier of `length` characters.
    pub fn with_length(length: usize) -> Result<Self, PkceError> {
        let verifier = generate_verifier(length)?;
        let challenge = verifier.challenge();
        Ok(Self {
            verifier,
            challenge,
        })
    }
}
