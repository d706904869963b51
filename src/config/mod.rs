use crate::auth::pkce::{DEFAULT_VERIFIER_LEN, MAX_VERIFIER_LEN, MIN_VERIFIER_LEN};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const APP_DIR: &str = "pkce-login";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public client identifier registered with the authorization server.
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,

    pub authorize_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub logout_url: String,

    /// Directory holding the durable session file.
    pub data_dir: PathBuf,

    /// Verifier length, 43..=128. Default: 64.
    pub verifier_length: usize,
    /// How long a pending authorization stays redeemable. Default: 600 (10 minutes).
    pub pending_ttl_secs: u64,
    /// Timeout for token, profile and logout requests. Default: 30.
    pub request_timeout_secs: u64,
    /// How long `login` waits for the browser redirect. Default: 300 (5 minutes).
    pub callback_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".pkce-login"));

        Self {
            client_id: String::new(),
            redirect_uri: "http://localhost:3000/callback".into(),
            scope: "read".into(),
            authorize_url: "http://localhost:8000/o/authorize/".into(),
            token_url: "http://localhost:8000/o/token/".into(),
            profile_url: "http://localhost:8000/api/userinfo/".into(),
            logout_url: "http://localhost:8000/api/logout/".into(),
            data_dir,
            verifier_length: DEFAULT_VERIFIER_LEN,
            pending_ttl_secs: 600,
            request_timeout_secs: 30,
            callback_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join(APP_DIR).join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".pkce-login/config.toml"))
    }

    /// Path to the durable session file.
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Validate into the settings the session controller runs with.
    pub fn client_settings(&self) -> Result<ClientSettings> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id is not set".into()));
        }
        if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&self.verifier_length) {
            return Err(Error::Config(format!(
                "verifier_length must be within {MIN_VERIFIER_LEN}..={MAX_VERIFIER_LEN}, got {}",
                self.verifier_length
            )));
        }

        Ok(ClientSettings {
            client_id: self.client_id.clone(),
            redirect_uri: parse_url("redirect_uri", &self.redirect_uri)?,
            scope: self.scope.clone(),
            authorize_url: parse_url("authorize_url", &self.authorize_url)?,
            token_url: parse_url("token_url", &self.token_url)?,
            profile_url: parse_url("profile_url", &self.profile_url)?,
            logout_url: parse_url("logout_url", &self.logout_url)?,
            verifier_length: self.verifier_length,
            pending_ttl: Duration::from_secs(self.pending_ttl_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }

    #[must_use]
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("{field} {value:?} is not a valid URL: {e}")))
}

/// Validated client registration and endpoints.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_id: String,
    pub redirect_uri: Url,
    pub scope: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub profile_url: Url,
    pub logout_url: Url,
    pub verifier_length: usize,
    pub pending_ttl: Duration,
    pub request_timeout: Duration,
}
