//! Persisted session tokens.
//!
//! The session lives under two keys, `accessToken` and `refreshToken`. The
//! file-backed store keeps them as a small JSON document so the session
//! survives restarts; the in-memory store is for tests and ephemeral runs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    #[serde(rename = "accessToken", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl SessionTokens {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

/// Client-local token storage shared by every in-flight request.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> SessionTokens;

    fn save(&self, tokens: &SessionTokens);

    fn set_access_token(&self, token: &str) {
        let mut tokens = self.load();
        tokens.access_token = Some(token.to_string());
        self.save(&tokens);
    }

    fn clear(&self) {
        self.save(&SessionTokens::default());
    }
}

/// Tokens held in memory only.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<SessionTokens>,
}

impl MemoryTokenStore {
    pub fn new(tokens: SessionTokens) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> SessionTokens {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, tokens: &SessionTokens) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = tokens.clone();
    }
}

/// Tokens persisted as JSON at a fixed path.
///
/// Read or write failures are logged and treated as an empty session; a
/// broken token file must never take the client down.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, tokens: &SessionTokens) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(tokens)?;
        fs::write(&self.path, json)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> SessionTokens {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Unreadable token file");
                SessionTokens::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionTokens::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token file");
                SessionTokens::default()
            }
        }
    }

    fn save(&self, tokens: &SessionTokens) {
        let _lock = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.write(tokens) {
            Ok(()) => debug!(path = %self.path.display(), "Session tokens persisted"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to persist tokens"),
        }
    }

    fn set_access_token(&self, token: &str) {
        // Read-modify-write under the lock so a concurrent clear is not undone.
        let _lock = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tokens = self.load();
        tokens.access_token = Some(token.to_string());
        if let Err(e) = self.write(&tokens) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist access token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_roundtrip_uses_storage_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path().join("session/tokens.json"));

        assert!(store.load().is_empty());

        store.save(&SessionTokens::new("access-1", "refresh-1"));
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains(ACCESS_TOKEN_KEY));
        assert!(raw.contains(REFRESH_TOKEN_KEY));

        store.set_access_token("access-2");
        let tokens = store.load();
        assert_eq!(tokens.access_token.as_deref(), Some("access-2"));
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));

        store.clear();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_reads_as_empty_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "{not json").unwrap();

        assert!(FileTokenStore::new(path).load().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTokenStore::new(SessionTokens::new("a", "r"));
        store.set_access_token("b");
        assert_eq!(store.load().access_token.as_deref(), Some("b"));
        store.clear();
        assert!(store.load().is_empty());
    }
}
