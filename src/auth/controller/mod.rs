//! Authentication session state machine.
//!
//! Login spans two process lifetimes (or two page loads): [`SessionController::begin_login`]
//! leaves for the authorization server, and the redirect back is handled by
//! [`SessionController::initialize`] / [`SessionController::handle_callback`] on a
//! controller that may have been rebuilt from scratch. Only the durable
//! [`SessionStore`] crosses that boundary.

use super::error::{AuthError, AuthErrorKind, ProfileError, format_oauth_error};
use super::navigator::Navigator;
use super::pkce::{Challenge, PkceCodes};
use super::storage::{PendingAuthorization, SessionStore, StorageError, TokenSet};
use crate::config::ClientSettings;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Query parameters the authorization server adds to the redirect.
const CALLBACK_PARAMS: [&str; 4] = ["code", "state", "error", "error_description"];

/// Authentication status of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// Verifier stored and redirect issued; waiting for the code.
    AwaitingCallback,
    Authenticated,
    Error {
        kind: AuthErrorKind,
        message: String,
    },
}

impl AuthState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AwaitingCallback => "awaiting callback",
            Self::Authenticated => "authenticated",
            Self::Error { .. } => "in error",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error { kind, message } => write!(f, "error ({kind}): {message}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Outcome of [`SessionController::fetch_profile`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileResult {
    Profile(serde_json::Value),
    Failed(ProfileError),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Owns the session state machine and every read/write of the session store.
pub struct SessionController {
    settings: ClientSettings,
    store: SessionStore,
    navigator: Arc<dyn Navigator>,
    client: reqwest::Client,
    state: AuthState,
}

impl SessionController {
    /// Create a controller, restoring state from durable storage.
    ///
    /// Stored tokens are trusted as-is; nothing is verified over the network.
    pub fn new(
        settings: ClientSettings,
        store: SessionStore,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| AuthError::TransportFailure(format!("Failed to build HTTP client: {e}")))?;

        let state = Self::restore_state(&store)?;
        debug!(state = %state, "Session restored");

        Ok(Self {
            settings,
            store,
            navigator,
            client,
            state,
        })
    }

    fn restore_state(store: &SessionStore) -> Result<AuthState, AuthError> {
        if store.tokens()?.is_some() {
            return Ok(AuthState::Authenticated);
        }

        match store.pending() {
            Ok(Some(_)) => Ok(AuthState::AwaitingCallback),
            Ok(None) => Ok(AuthState::Unauthenticated),
            Err(StorageError::Corrupt(detail)) => {
                warn!("Discarding unreadable pending authorization: {detail}");
                store.clear_pending()?;
                Ok(AuthState::Unauthenticated)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    #[must_use]
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Entry point for an application load at `current_url`.
    ///
    /// An `error` parameter ends the pending attempt, a `code` parameter is
    /// redeemed, anything else keeps the restored state.
    pub async fn initialize(&mut self, current_url: &Url) -> Result<(), AuthError> {
        let mut code = None;
        let mut error = None;
        let mut description = None;
        for (key, value) in current_url.query_pairs() {
            match &*key {
                "code" => code = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }

        // A stored session wins over a stale redirect (reload, replayed URL).
        if self.state.is_authenticated() && (code.is_some() || error.is_some()) {
            debug!("Ignoring authorization parameters while signed in");
            self.navigator
                .replace_location(&strip_authorization_params(current_url));
            return Ok(());
        }

        if let Some(error) = error {
            return self.handle_denial(error, description, current_url);
        }
        if let Some(code) = code {
            return self.complete_callback(&code, current_url).await;
        }

        if self.state.is_authenticated() {
            info!("Using stored session");
        }
        Ok(())
    }

    /// Authorization request URL for `challenge`.
    #[must_use]
    pub fn authorization_url(&self, challenge: &Challenge) -> Url {
        let mut url = self.settings.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", self.settings.redirect_uri.as_str())
            .append_pair("scope", &self.settings.scope)
            .append_pair("code_challenge", challenge.as_str())
            .append_pair("code_challenge_method", "S256");
        url
    }

    /// Start a login: store a fresh verifier and navigate to the authorization server.
    ///
    /// Replaces any earlier pending attempt. Returns the authorization URL.
    pub fn begin_login(&mut self) -> Result<Url, AuthError> {
        if self.state.is_authenticated() {
            return Err(AuthError::InvalidTransition {
                operation: "begin login",
                state: self.state.name(),
            });
        }

        let pkce = PkceCodes::with_length(self.settings.verifier_length)
            .map_err(|e| self.fail(e.into()))?;

        self.store
            .save_pending(&PendingAuthorization::new(pkce.verifier))
            .map_err(|e| self.fail(e.into()))?;

        let url = self.authorization_url(&pkce.challenge);
        debug!(challenge = %pkce.challenge, "Built authorization request");

        self.state = AuthState::AwaitingCallback;
        info!("Redirecting to authorization server");
        self.navigator.navigate(&url);

        Ok(url)
    }

    /// Redeem an authorization code received on the redirect URI.
    pub async fn handle_callback(&mut self, code: &str) -> Result<(), AuthError> {
        let landing = strip_authorization_params(&self.settings.redirect_uri);
        self.complete_callback(code, &landing).await
    }

    async fn complete_callback(&mut self, code: &str, visible_url: &Url) -> Result<(), AuthError> {
        let pending = match self.store.pending() {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                warn!("Authorization callback without a pending verifier");
                return Err(self.abandon_attempt(AuthError::MissingVerifier, visible_url));
            }
            Err(StorageError::Corrupt(detail)) => {
                warn!("Pending authorization unreadable: {detail}");
                return Err(self.abandon_attempt(AuthError::MissingVerifier, visible_url));
            }
            Err(e) => return Err(self.fail(e.into())),
        };

        let age_secs = pending.age_secs();
        if !self.settings.pending_ttl.is_zero()
            && age_secs > i64::try_from(self.settings.pending_ttl.as_secs()).unwrap_or(i64::MAX)
        {
            warn!(age_secs, "Pending authorization expired");
            return Err(self.abandon_attempt(AuthError::VerifierExpired { age_secs }, visible_url));
        }

        match self.exchange_code(code, &pending).await {
            Ok(tokens) => {
                self.store
                    .save_tokens(&tokens)
                    .map_err(|e| self.fail(e.into()))?;
                self.store
                    .clear_pending()
                    .map_err(|e| self.fail(e.into()))?;
                self.navigator
                    .replace_location(&strip_authorization_params(visible_url));
                self.state = AuthState::Authenticated;
                info!("Login complete");
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                // The code was never redeemed; the same verifier can be retried.
                warn!("Token exchange did not reach the server: {err}");
                self.reset_after_failure(false, visible_url);
                Err(self.fail(err))
            }
            Err(err) => {
                // Codes are single use, so this verifier can never succeed again.
                warn!("Token exchange rejected: {err}");
                self.reset_after_failure(true, visible_url);
                Err(self.fail(err))
            }
        }
    }

    async fn exchange_code(
        &self,
        code: &str,
        pending: &PendingAuthorization,
    ) -> Result<TokenSet, AuthError> {
        let response = self
            .client
            .post(self.settings.token_url.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("code_verifier", pending.verifier.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::TransportFailure(format!("Failed to send token request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchangeRejected {
                status: status.as_u16(),
                detail: format_oauth_error(&text),
            });
        }

        // The server answered, so the code is spent even if the body is lost.
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::TokenExchangeRejected {
                status: status.as_u16(),
                detail: format!("Failed to read token response: {e}"),
            })?;
        let token_response: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::TokenExchangeRejected {
                status: status.as_u16(),
                detail: format!("Failed to parse token response: {e}"),
            })?;

        match token_response.access_token {
            Some(access_token) if !access_token.is_empty() => Ok(TokenSet {
                access_token,
                refresh_token: token_response.refresh_token.unwrap_or_default(),
            }),
            _ => Err(AuthError::TokenExchangeRejected {
                status: status.as_u16(),
                detail: "response did not include an access_token".into(),
            }),
        }
    }

    fn handle_denial(
        &mut self,
        error: String,
        description: Option<String>,
        visible_url: &Url,
    ) -> Result<(), AuthError> {
        warn!(error = %error, "Authorization server returned an error");
        self.reset_after_failure(true, visible_url);
        Err(self.fail(AuthError::AuthorizationDenied { error, description }))
    }

    /// Fetch the user's profile with the stored bearer token.
    ///
    /// Failures come back as [`ProfileResult::Failed`] and leave the session untouched.
    pub async fn fetch_profile(&self) -> ProfileResult {
        if !self.state.is_authenticated() {
            return ProfileResult::Failed(ProfileError::NotAuthenticated);
        }
        let tokens = match self.store.tokens() {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return ProfileResult::Failed(ProfileError::NotAuthenticated),
            Err(e) => return ProfileResult::Failed(ProfileError::Storage(e.to_string())),
        };

        let response = match self
            .client
            .get(self.settings.profile_url.clone())
            .bearer_auth(&tokens.access_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return ProfileResult::Failed(ProfileError::TransportFailure(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(status = %status, "Profile request failed");
            return ProfileResult::Failed(ProfileError::Status {
                status: status.as_u16(),
                body: format_oauth_error(&text),
            });
        }

        match response.json::<serde_json::Value>().await {
            Ok(profile) => ProfileResult::Profile(profile),
            Err(e) if e.is_decode() => ProfileResult::Failed(ProfileError::InvalidBody(e.to_string())),
            Err(e) => ProfileResult::Failed(ProfileError::TransportFailure(e.to_string())),
        }
    }

    /// Log out: tell the server (best effort), then clear local state.
    ///
    /// Local cleanup happens whether or not the remote call succeeds.
    pub async fn logout(&mut self) -> Result<(), AuthError> {
        let tokens = match self.store.tokens() {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Could not read stored tokens before logout: {e}");
                None
            }
        };

        if let Some(tokens) = tokens {
            self.remote_logout(&tokens.access_token).await;
        }

        self.store
            .clear_tokens()
            .map_err(|e| self.fail(e.into()))?;
        self.store
            .clear_pending()
            .map_err(|e| self.fail(e.into()))?;
        self.state = AuthState::Unauthenticated;
        info!("Logged out");
        Ok(())
    }

    async fn remote_logout(&self, access_token: &str) {
        match self
            .client
            .post(self.settings.logout_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => debug!("Remote logout accepted"),
            Ok(response) => warn!(status = %response.status(), "Remote logout failed"),
            Err(e) => warn!("Remote logout failed: {e}"),
        }
    }

    /// Drop the session after a failed callback. Storage errors here are
    /// logged, the original failure is what gets reported.
    fn reset_after_failure(&self, discard_pending: bool, visible_url: &Url) {
        if let Err(e) = self.store.clear_tokens() {
            warn!("Failed to clear session: {e}");
        }
        if discard_pending {
            if let Err(e) = self.store.clear_pending() {
                warn!("Failed to discard pending authorization: {e}");
            }
            // Nothing left to redeem, so a reload must not replay the callback.
            self.navigator
                .replace_location(&strip_authorization_params(visible_url));
        }
    }

    /// End a callback that never reached the token endpoint. The pending
    /// record is dropped; an existing session is left alone.
    fn abandon_attempt(&mut self, err: AuthError, visible_url: &Url) -> AuthError {
        if let Err(e) = self.store.clear_pending() {
            warn!("Failed to discard pending authorization: {e}");
        }
        self.navigator
            .replace_location(&strip_authorization_params(visible_url));
        if self.state.is_authenticated() {
            err
        } else {
            self.fail(err)
        }
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        self.state = AuthState::Error {
            kind: err.kind(),
            message: err.to_string(),
        };
        err
    }
}

/// `url` without the parameters an authorization redirect adds.
#[must_use]
pub fn strip_authorization_params(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !CALLBACK_PARAMS.iter().any(|param| key == param))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}
