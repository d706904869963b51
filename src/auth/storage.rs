//! Durable client-side storage for the session and the pending authorization.

use super::pkce::Verifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Storage key for the access token.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Storage key for the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Storage key for the single-slot pending authorization.
pub const PENDING_KEY: &str = "pkceVerifier";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt storage: {0}")]
    Corrupt(String),
}

/// String-keyed store with get/set/remove semantics and no expiry.
///
/// Batch operations apply as one unit: either every entry is written or none.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError>;

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set_many(&[(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.remove_many(&[key])
    }
}

/// JSON file backed store. Survives process restarts.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open a store at `path`, creating the parent directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<HashMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_file(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(entries)?;

        // Write a sibling file and rename over the target so a crash never
        // leaves a half-written session behind.
        let tmp = self.path.with_extension("json.tmp");
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Owner-only from creation; tokens are never readable by others.
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_file()?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut file = self.read_file()?;
        for (key, value) in entries {
            file.insert((*key).to_string(), (*value).to_string());
        }
        self.write_file(&file)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut file = self.read_file()?;
        let before = file.len();
        for key in keys {
            file.remove(*key);
        }
        if file.len() == before {
            return Ok(());
        }
        self.write_file(&file)
    }
}

/// In-process store. Nothing outlives the value.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set_many(&self, new_entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in new_entries {
            entries.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// Tokens issued by a successful code exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    /// Bearer credential for the resource server.
    pub access_token: String,
    /// Kept for a future refresh grant; empty when the server issued none.
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .finish()
    }
}

/// The verifier carried across the redirect, with the time it was issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub verifier: Verifier,
    pub issued_at: DateTime<Utc>,
}

impl PendingAuthorization {
    #[must_use]
    pub fn new(verifier: Verifier) -> Self {
        Self {
            verifier,
            issued_at: Utc::now(),
        }
    }

    /// Seconds since the record was issued (negative if the clock moved back).
    #[must_use]
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.issued_at).num_seconds()
    }
}

/// Typed view over a [`KeyValueStore`] holding the session and the pending
/// authorization.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Session store over a fresh [`MemoryStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Stored tokens, if the user is authenticated.
    pub fn tokens(&self) -> Result<Option<TokenSet>, StorageError> {
        let Some(access_token) = self.backend.get(ACCESS_TOKEN_KEY)? else {
            return Ok(None);
        };
        if access_token.is_empty() {
            return Ok(None);
        }
        let refresh_token = self.backend.get(REFRESH_TOKEN_KEY)?.unwrap_or_default();
        Ok(Some(TokenSet {
            access_token,
            refresh_token,
        }))
    }

    pub fn save_tokens(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        self.backend.set_many(&[
            (ACCESS_TOKEN_KEY, tokens.access_token.as_str()),
            (REFRESH_TOKEN_KEY, tokens.refresh_token.as_str()),
        ])
    }

    pub fn clear_tokens(&self) -> Result<(), StorageError> {
        self.backend
            .remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])
    }

    /// The in-flight authorization, if any.
    ///
    /// A record that no longer parses is treated as corrupt rather than
    /// silently ignored.
    pub fn pending(&self) -> Result<Option<PendingAuthorization>, StorageError> {
        let Some(raw) = self.backend.get(PENDING_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("pending authorization: {e}")))
    }

    /// Store `pending`, replacing any earlier attempt.
    pub fn save_pending(&self, pending: &PendingAuthorization) -> Result<(), StorageError> {
        let raw = serde_json::to_string(pending)?;
        self.backend.set(PENDING_KEY, &raw)
    }

    pub fn clear_pending(&self) -> Result<(), StorageError> {
        self.backend.remove(PENDING_KEY)
    }
}
