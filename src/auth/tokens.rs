//! Token storage and management

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Access/refresh token pair as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Vec<String>,
}

impl OAuthToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// Derived classification of the persisted token; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Absent,
    Valid,
    Expired,
}

/// Result of loading the token record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredToken {
    Absent,
    Valid(OAuthToken),
    Expired(OAuthToken),
}

impl StoredToken {
    pub fn classify(token: Option<OAuthToken>, now: DateTime<Utc>) -> Self {
        match token {
            None => Self::Absent,
            Some(token) if token.is_expired_at(now) => Self::Expired(token),
            Some(token) => Self::Valid(token),
        }
    }

    pub fn state(&self) -> TokenState {
        match self {
            Self::Absent => TokenState::Absent,
            Self::Valid(_) => TokenState::Valid,
            Self::Expired(_) => TokenState::Expired,
        }
    }

    pub fn token(&self) -> Option<&OAuthToken> {
        match self {
            Self::Absent => None,
            Self::Valid(token) | Self::Expired(token) => Some(token),
        }
    }
}

/// Token store trait for different storage backends
pub trait TokenStore {
    fn load(&self) -> Result<StoredToken, AuthError>;
    fn save(&self, token: &OAuthToken) -> Result<(), AuthError>;
}

/// Single JSON record on the local filesystem, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<StoredToken, AuthError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No token record at {}", self.path.display());
                return Ok(StoredToken::Absent);
            }
            Err(e) => return Err(AuthError::storage("reading the token file", e)),
        };

        let token: OAuthToken = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::storage("parsing the token file", e))?;
        Ok(StoredToken::classify(Some(token), Utc::now()))
    }

    fn save(&self, token: &OAuthToken) -> Result<(), AuthError> {
        if token.access_token.is_empty() && token.refresh_token.is_empty() {
            return Err(AuthError::storage(
                "validating the token",
                "refusing to persist a token without access or refresh token",
            ));
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| AuthError::storage("creating the token directory", e))?;
        }

        let content = serde_json::to_vec_pretty(token)
            .map_err(|e| AuthError::storage("serializing the token", e))?;

        // Previous record stays in place until the rename succeeds.
        let tmp = self.tmp_path();
        let written = write_private(&tmp, &content).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(AuthError::storage("writing the token file", e));
        }

        tracing::debug!("Token saved to {}", self.path.display());
        Ok(())
    }
}

/// Write a file readable only by the current user (it contains tokens).
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}
