//! Configuration loading

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::OAuthParams;

const IDENTITY_HOST: &str = "https://login.microsoftonline.com";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OAuth2 client ID (public client, no secret)
    pub client_id: String,
    /// Azure AD tenant (common for multi-tenant)
    pub tenant: String,
    /// Loopback address the identity provider redirects to
    pub redirect_uri: String,
    /// Requested scopes, in order
    pub scopes: Vec<String>,
    /// Where the token record lives; defaults to the data directory
    pub token_path: Option<PathBuf>,
    /// How long to wait for the browser sign-in
    pub callback_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: "2124cbcc-943a-4a41-b8b2-efabbfc99b65".to_string(),
            tenant: "common".to_string(),
            redirect_uri: "http://localhost:5992/oauthv2".to_string(),
            scopes: [
                "offline_access",
                "Notes.ReadWrite.All",
                "Notes.Create",
                "Notes.Read",
                "Notes.ReadWrite",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            token_path: None,
            callback_timeout_secs: 300,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "cnote", "cnote").context("Could not determine config directory")
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn oauth_params(&self) -> Result<OAuthParams> {
        let params = OAuthParams::new(
            format!("{}/{}/oauth2/v2.0/authorize", IDENTITY_HOST, self.tenant),
            format!("{}/{}/oauth2/v2.0/token", IDENTITY_HOST, self.tenant),
            self.redirect_uri.clone(),
            self.client_id.clone(),
            self.scopes.iter().cloned(),
        )?;
        Ok(params)
    }

    pub fn token_path(&self) -> Result<PathBuf> {
        match &self.token_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("token.json")),
        }
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}
