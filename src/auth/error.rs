//! Authentication error types.

use super::pkce::PkceError;
use super::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No pending authorization for this callback; start the login again")]
    MissingVerifier,

    #[error("Pending authorization expired {age_secs}s after it was issued; start the login again")]
    VerifierExpired { age_secs: i64 },

    #[error("Authorization denied: {}", describe(error, description.as_deref()))]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("Token exchange rejected (HTTP {status}): {detail}")]
    TokenExchangeRejected { status: u16, detail: String },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("PKCE error: {0}")]
    Pkce(#[from] PkceError),

    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Coarse classification of an [`AuthError`], kept in the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    MissingVerifier,
    VerifierExpired,
    AuthorizationDenied,
    TokenExchangeRejected,
    TransportFailure,
    SecureRandomUnavailable,
    InvalidVerifier,
    InvalidTransition,
    Storage,
}

impl AuthErrorKind {
    /// Whether the same logical operation may be retried as-is.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransportFailure)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingVerifier => "missing_verifier",
            Self::VerifierExpired => "verifier_expired",
            Self::AuthorizationDenied => "authorization_denied",
            Self::TokenExchangeRejected => "token_exchange_rejected",
            Self::TransportFailure => "transport_failure",
            Self::SecureRandomUnavailable => "secure_random_unavailable",
            Self::InvalidVerifier => "invalid_verifier",
            Self::InvalidTransition => "invalid_transition",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuthError {
    #[must_use]
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            Self::MissingVerifier => AuthErrorKind::MissingVerifier,
            Self::VerifierExpired { .. } => AuthErrorKind::VerifierExpired,
            Self::AuthorizationDenied { .. } => AuthErrorKind::AuthorizationDenied,
            Self::TokenExchangeRejected { .. } => AuthErrorKind::TokenExchangeRejected,
            Self::TransportFailure(_) => AuthErrorKind::TransportFailure,
            Self::Pkce(PkceError::SecureRandomUnavailable(_)) => {
                AuthErrorKind::SecureRandomUnavailable
            }
            Self::Pkce(_) => AuthErrorKind::InvalidVerifier,
            Self::InvalidTransition { .. } => AuthErrorKind::InvalidTransition,
            Self::Storage(_) => AuthErrorKind::Storage,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Failure of a profile fetch. Returned as data, never as a session error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Failed to fetch profile (HTTP {status}): {body}")]
    Status { status: u16, body: String },

    #[error("Network error while fetching profile: {0}")]
    TransportFailure(String),

    #[error("Profile response was not valid JSON: {0}")]
    InvalidBody(String),

    #[error("Could not read session: {0}")]
    Storage(String),
}

fn describe(error: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.is_empty() => format!("{error} - {d}"),
        _ => error.to_string(),
    }
}

/// Condense an OAuth error body into one line.
///
/// Handles `{"error": "...", "error_description": "..."}` (RFC 6749 5.2),
/// `{"detail": "..."}`, and falls back to the raw text.
#[must_use]
pub fn format_oauth_error(body: &str) -> String {
    let body = body.trim();
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(error) = json.get("error").and_then(|v| v.as_str()) {
            return describe(
                error,
                json.get("error_description").and_then(|v| v.as_str()),
            );
        }
        if let Some(detail) = json.get("detail").and_then(|v| v.as_str()) {
            return detail.to_string();
        }
    }

    if body.is_empty() {
        "empty response body".to_string()
    } else {
        body.to_string()
    }
}
