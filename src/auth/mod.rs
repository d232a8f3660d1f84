//! Authentication module for the Microsoft identity platform
//!
//! Implements the OAuth2 authorization code flow with a loopback redirect,
//! persists the resulting token and refreshes it transparently.

pub mod account;
pub mod error;
pub mod listener;
pub mod oauth;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_support;

pub use account::{AccountResolver, SetupPrompt};
pub use error::AuthError;
pub use oauth::{AuthorizationFlow, SystemBrowser, TokenRefresher, UrlOpener};
pub use tokens::{FileTokenStore, OAuthToken, StoredToken, TokenState, TokenStore};

use url::Url;

/// OAuth2 client configuration, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthParams {
    authorization_endpoint: String,
    token_endpoint: String,
    redirect_uri: String,
    client_id: String,
    scopes: Vec<String>,
}

impl OAuthParams {
    pub fn new(
        authorization_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        redirect_uri: impl Into<String>,
        client_id: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, AuthError> {
        let params = Self {
            authorization_endpoint: authorization_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            redirect_uri: redirect_uri.into(),
            client_id: client_id.into(),
            scopes: dedup(scopes.into_iter().map(Into::into)),
        };

        for (name, value) in [
            ("authorization endpoint", &params.authorization_endpoint),
            ("token endpoint", &params.token_endpoint),
            ("redirect URI", &params.redirect_uri),
        ] {
            Url::parse(value).map_err(|e| AuthError::InvalidParams(format!("{}: {}", name, e)))?;
        }
        if params.client_id.trim().is_empty() {
            return Err(AuthError::InvalidParams("client_id is empty".to_string()));
        }

        Ok(params)
    }

    pub fn authorization_endpoint(&self) -> &str {
        &self.authorization_endpoint
    }

    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

/// Keep first occurrence order, drop repeats and blanks.
fn dedup(scopes: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for scope in scopes {
        let scope = scope.trim().to_string();
        if !scope.is_empty() && !out.contains(&scope) {
            out.push(scope);
        }
    }
    out
}
