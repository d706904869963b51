//! OAuth 2.0 Authorization Code login with PKCE (RFC 7636).
//!
//! The flow spans two "page loads": [`SessionController::begin_login`] stores a
//! verifier and navigates away, and a later [`SessionController::initialize`]
//! with the redirect URL exchanges the code for tokens.

mod controller;
mod error;
mod navigator;
pub mod pkce;
mod server;
mod storage;

pub use controller::{AuthState, ProfileResult, SessionController, strip_authorization_params};
pub use error::{AuthError, AuthErrorKind, ProfileError, format_oauth_error};
pub use navigator::{BrowserNavigator, Navigator};
pub use pkce::PkceCodes;
pub use server::{CallbackServer, is_loopback_redirect};
pub use storage::{
    FileStore, KeyValueStore, MemoryStore, PendingAuthorization, SessionStore, StorageError,
    TokenSet,
};

use crate::config::Config;
use std::sync::Arc;

/// Build a controller backed by the session file and the system browser.
pub fn controller_from_config(config: &Config) -> crate::error::Result<SessionController> {
    let settings = config.client_settings()?;
    let backend = FileStore::open(config.session_path())?;
    let store = SessionStore::new(Arc::new(backend));
    Ok(SessionController::new(
        settings,
        store,
        Arc::new(BrowserNavigator),
    )?)
}
