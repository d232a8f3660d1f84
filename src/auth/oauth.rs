//! OAuth2 authorization code flow with loopback redirect, plus token refresh

use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, CsrfToken, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use url::Url;

use super::listener::RedirectListener;
use super::{AuthError, OAuthParams, OAuthToken};

/// Default time the user gets to finish the browser consent.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

type TokenRequestError =
    RequestTokenError<oauth2::reqwest::Error<reqwest::Error>, BasicErrorResponse>;

/// Something that can show the consent page to the user.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs with the platform's default browser.
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Build the OAuth2 client from OAuthParams
fn build_client(params: &OAuthParams) -> Result<BasicClient, AuthError> {
    let auth_url = AuthUrl::new(params.authorization_endpoint().to_string())
        .map_err(|e| AuthError::InvalidParams(format!("authorization endpoint: {}", e)))?;
    let token_url = TokenUrl::new(params.token_endpoint().to_string())
        .map_err(|e| AuthError::InvalidParams(format!("token endpoint: {}", e)))?;
    let redirect_url = RedirectUrl::new(params.redirect_uri().to_string())
        .map_err(|e| AuthError::InvalidParams(format!("redirect URI: {}", e)))?;

    Ok(BasicClient::new(
        ClientId::new(params.client_id().to_string()),
        None,
        auth_url,
        Some(token_url),
    )
    .set_redirect_uri(redirect_url))
}

/// Drives the browser consent and exchanges the returned code.
pub struct AuthorizationFlow {
    params: OAuthParams,
    opener: Box<dyn UrlOpener>,
    timeout: Duration,
}

impl AuthorizationFlow {
    pub fn new(params: OAuthParams, opener: Box<dyn UrlOpener>) -> Self {
        Self {
            params,
            opener,
            timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Consent page URL carrying client_id, redirect_uri, scope,
    /// `response_type=code` and the given state.
    pub fn authorize_url(&self, state: &str) -> Result<Url, AuthError> {
        let client = build_client(&self.params)?;
        let state = state.to_string();
        let (url, _) = client
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(self.params.scopes().iter().cloned().map(Scope::new))
            .url();
        Ok(url)
    }

    pub async fn authorize(&self, out: &mut (dyn Write + Send)) -> Result<OAuthToken, AuthError> {
        let client = build_client(&self.params)?;
        let state = uuid::Uuid::new_v4().to_string();
        let url = self.authorize_url(&state)?;

        // Bind before the browser can possibly redirect.
        let listener = RedirectListener::bind(self.params.redirect_uri())
            .await?
            .with_state(state);

        writeln!(out).map_err(AuthError::Terminal)?;
        writeln!(out, "To sign in, open this URL in your browser:").map_err(AuthError::Terminal)?;
        writeln!(out, "  {}", url).map_err(AuthError::Terminal)?;
        writeln!(
            out,
            "Waiting up to {} seconds for the sign-in to complete...",
            self.timeout.as_secs()
        )
        .map_err(AuthError::Terminal)?;
        out.flush().map_err(AuthError::Terminal)?;

        if let Err(e) = self.opener.open(url.as_str()) {
            tracing::warn!("Could not open a browser ({}); use the URL above", e);
        }

        tracing::info!("Waiting for authorization callback...");
        let code = listener.listen(self.timeout).await?;

        tracing::info!("Exchanging authorization code for tokens...");
        tracing::debug!("Token endpoint: {}", self.params.token_endpoint());
        let issued_at = Utc::now();
        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(async_http_client)
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(describe(e)))?;

        token_from_response(&response, issued_at, None, self.params.scopes())
            .map_err(AuthError::TokenExchangeFailed)
    }
}

/// Exchanges a refresh token for a new access token, no user interaction.
pub struct TokenRefresher {
    params: OAuthParams,
}

impl TokenRefresher {
    pub fn new(params: OAuthParams) -> Self {
        Self { params }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthToken, AuthError> {
        let client = build_client(&self.params)?;

        tracing::info!("Refreshing access token...");
        let issued_at = Utc::now();
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| AuthError::RefreshFailed(describe(e)))?;

        token_from_response(
            &response,
            issued_at,
            Some(refresh_token),
            self.params.scopes(),
        )
        .map_err(AuthError::RefreshFailed)
    }
}

/// Build the persisted token from a token endpoint response. The refresh
/// token falls back to `prior_refresh` when the provider omits it.
fn token_from_response(
    response: &BasicTokenResponse,
    issued_at: DateTime<Utc>,
    prior_refresh: Option<&str>,
    requested_scopes: &[String],
) -> Result<OAuthToken, String> {
    let access_token = response.access_token().secret().to_string();
    if access_token.is_empty() {
        return Err("token response carried an empty access_token".to_string());
    }

    let expires_in = response
        .expires_in()
        .ok_or_else(|| "token response is missing expires_in".to_string())?;
    let expires_at = chrono::Duration::from_std(expires_in)
        .ok()
        .and_then(|d| issued_at.checked_add_signed(d))
        .ok_or_else(|| "token response has an out-of-range expires_in".to_string())?;

    let refresh_token = response
        .refresh_token()
        .map(|rt| rt.secret().to_string())
        .or_else(|| prior_refresh.map(str::to_string))
        .unwrap_or_default();

    let scope = match response.scopes() {
        Some(scopes) if !scopes.is_empty() => scopes.iter().map(|s| s.as_str().to_owned()).collect(),
        _ => requested_scopes.to_vec(),
    };

    Ok(OAuthToken {
        access_token,
        refresh_token,
        expires_at,
        scope,
    })
}

fn describe(err: TokenRequestError) -> String {
    match err {
        RequestTokenError::ServerResponse(resp) => resp.to_string(),
        RequestTokenError::Request(e) => {
            tracing::debug!("Token endpoint transport error: {}", e);
            "token endpoint unreachable".to_string()
        }
        RequestTokenError::Parse(e, _) => format!("malformed token response: {}", e),
        RequestTokenError::Other(msg) => msg,
    }
}
