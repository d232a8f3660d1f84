//! Account resolution: turns whatever is on disk into a usable token
//!
//! Absent  -> ask the user, run the authorization flow, save.
//! Expired -> refresh, save; fall back to the authorization flow if the
//!            provider rejects the refresh token.
//! Valid   -> return the cached token, no network.

use std::io::Write;
use std::time::Duration;

use super::oauth::{AuthorizationFlow, TokenRefresher, UrlOpener};
use super::{AuthError, OAuthParams, OAuthToken, StoredToken, TokenStore};

/// Interactive yes/no asked before the first sign-in.
pub trait SetupPrompt {
    fn ask_setup_account(&self) -> Result<bool, AuthError>;
}

impl<P: SetupPrompt + ?Sized> SetupPrompt for &P {
    fn ask_setup_account(&self) -> Result<bool, AuthError> {
        (**self).ask_setup_account()
    }
}

pub struct AccountResolver<S, P> {
    store: S,
    prompt: P,
    flow: AuthorizationFlow,
    refresher: TokenRefresher,
}

impl<S: TokenStore, P: SetupPrompt> AccountResolver<S, P> {
    pub fn new(params: OAuthParams, store: S, prompt: P, opener: Box<dyn UrlOpener>) -> Self {
        Self {
            store,
            prompt,
            flow: AuthorizationFlow::new(params.clone(), opener),
            refresher: TokenRefresher::new(params),
        }
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.flow = self.flow.with_timeout(timeout);
        self
    }

    /// Current persisted state, without touching the network.
    pub fn status(&self) -> Result<StoredToken, AuthError> {
        self.store.load()
    }

    /// Return a token that is valid right now.
    pub async fn resolve_account(
        &self,
        out: &mut (dyn Write + Send),
    ) -> Result<OAuthToken, AuthError> {
        match self.store.load()? {
            StoredToken::Valid(token) => {
                tracing::debug!("Using cached access token (expires {})", token.expires_at);
                Ok(token)
            }
            StoredToken::Expired(token) => self.renew(token, out).await,
            StoredToken::Absent => {
                if !self.prompt.ask_setup_account()? {
                    return Err(AuthError::SetupDeclined);
                }
                self.reauthorize(out).await
            }
        }
    }

    /// Run the full authorization flow regardless of what is stored.
    pub async fn reauthorize(
        &self,
        out: &mut (dyn Write + Send),
    ) -> Result<OAuthToken, AuthError> {
        let token = self.flow.authorize(out).await?;
        self.store.save(&token)?;
        tracing::info!("Signed in; token saved");
        Ok(token)
    }

    async fn renew(
        &self,
        expired: OAuthToken,
        out: &mut (dyn Write + Send),
    ) -> Result<OAuthToken, AuthError> {
        if !expired.has_refresh_token() {
            tracing::info!("Access token expired and no refresh token stored; signing in again");
            return self.reauthorize(out).await;
        }

        match self.refresher.refresh(&expired.refresh_token).await {
            Ok(token) => {
                self.store.save(&token)?;
                tracing::info!("Access token refreshed");
                Ok(token)
            }
            Err(AuthError::RefreshFailed(reason)) => {
                tracing::warn!("Refresh failed, falling back to sign-in: {}", reason);
                writeln!(out, "Your session expired and could not be renewed ({}).", reason)
                    .map_err(AuthError::Terminal)?;
                self.reauthorize(out).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{free_port, params_for, FakeBrowser, ScriptedPrompt};
    use crate::auth::{FileTokenStore, TokenState};
    use chrono::{Duration as ChronoDuration, Utc};
    use mockito::Matcher;

    fn stored(access: &str, refresh: &str, expires_in_secs: i64) -> OAuthToken {
        OAuthToken {
            access_token: access.into(),
            refresh_token: refresh.into(),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            scope: vec!["offline_access".into()],
        }
    }

    fn resolver<'p>(
        server: &mockito::ServerGuard,
        store: &FileTokenStore,
        prompt: &'p ScriptedPrompt,
        browser: FakeBrowser,
    ) -> AccountResolver<FileTokenStore, &'p ScriptedPrompt> {
        AccountResolver::new(
            params_for(&server.url(), free_port()),
            store.clone(),
            prompt,
            Box::new(browser),
        )
        .with_callback_timeout(Duration::from_secs(10))
    }

    fn grant(kind: &str) -> Matcher {
        Matcher::UrlEncoded("grant_type".into(), kind.into())
    }

    #[tokio::test]
    async fn test_valid_token_is_reused_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));
        let cached = stored("at-cached", "rt", 3600);
        store.save(&cached).unwrap();

        let mut server = mockito::Server::new_async().await;
        let any = server.mock("POST", "/token").expect(0).create_async().await;
        let prompt = ScriptedPrompt::answering(true);
        let resolver = resolver(&server, &store, &prompt, FakeBrowser::silent());

        let first = resolver.resolve_account(&mut Vec::new()).await.unwrap();
        let second = resolver.resolve_account(&mut Vec::new()).await.unwrap();

        assert_eq!(first, cached);
        assert_eq!(second, cached);
        assert_eq!(prompt.times_asked(), 0);
        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_declined_setup_makes_no_network_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));

        let mut server = mockito::Server::new_async().await;
        let any = server.mock("POST", "/token").expect(0).create_async().await;
        let prompt = ScriptedPrompt::answering(false);
        let browser = FakeBrowser::replying("code=never");
        let resolver = resolver(&server, &store, &prompt, browser);

        let err = resolver.resolve_account(&mut Vec::new()).await.unwrap_err();

        assert!(matches!(err, AuthError::SetupDeclined));
        assert_eq!(prompt.times_asked(), 1);
        assert_eq!(store.load().unwrap(), StoredToken::Absent);
        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_first_run_authorizes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));

        let mut server = mockito::Server::new_async().await;
        let exchange = server
            .mock("POST", "/token")
            .match_body(grant("authorization_code"))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at-1","refresh_token":"rt-1","token_type":"Bearer","expires_in":3600}"#,
            )
            .create_async()
            .await;
        let prompt = ScriptedPrompt::answering(true);
        let resolver = resolver(&server, &store, &prompt, FakeBrowser::replying("code=C1"));

        let token = resolver.resolve_account(&mut Vec::new()).await.unwrap();

        exchange.assert_async().await;
        assert_eq!(token.access_token, "at-1");
        assert_eq!(store.load().unwrap(), StoredToken::Valid(token));
    }

    #[tokio::test]
    async fn test_expired_refresh_keeps_original_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));
        store.save(&stored("at-old", "rt-original", -60)).unwrap();

        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                grant("refresh_token"),
                Matcher::UrlEncoded("refresh_token".into(), "rt-original".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-new","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;
        let prompt = ScriptedPrompt::answering(true);
        let resolver = resolver(&server, &store, &prompt, FakeBrowser::silent());

        let token = resolver.resolve_account(&mut Vec::new()).await.unwrap();

        refresh.assert_async().await;
        assert_eq!(token.access_token, "at-new");
        assert_eq!(token.refresh_token, "rt-original");
        let persisted = store.load().unwrap();
        assert_eq!(persisted.state(), TokenState::Valid);
        assert_eq!(persisted.token().unwrap().refresh_token, "rt-original");
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));
        store.save(&stored("at-old", "rt-revoked", -60)).unwrap();

        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(grant("refresh_token"))
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;
        let exchange = server
            .mock("POST", "/token")
            .match_body(grant("authorization_code"))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at-fresh","refresh_token":"rt-fresh","token_type":"Bearer","expires_in":3600}"#,
            )
            .create_async()
            .await;
        let prompt = ScriptedPrompt::answering(true);
        let resolver = resolver(&server, &store, &prompt, FakeBrowser::replying("code=C2"));

        let mut out = Vec::new();
        let token = resolver.resolve_account(&mut out).await.unwrap();

        refresh.assert_async().await;
        exchange.assert_async().await;
        assert_eq!(token.refresh_token, "rt-fresh");
        assert_eq!(prompt.times_asked(), 0);
        assert!(String::from_utf8(out).unwrap().contains("could not be renewed"));
        assert_eq!(store.load().unwrap(), StoredToken::Valid(token));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_goes_straight_to_sign_in() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token.json"));
        store.save(&stored("at-old", "", -60)).unwrap();

        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(grant("refresh_token"))
            .expect(0)
            .create_async()
            .await;
        let exchange = server
            .mock("POST", "/token")
            .match_body(grant("authorization_code"))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-2","token_type":"Bearer","expires_in":60}"#)
            .create_async()
            .await;
        let prompt = ScriptedPrompt::answering(true);
        let resolver = resolver(&server, &store, &prompt, FakeBrowser::replying("code=C3"));

        let token = resolver.resolve_account(&mut Vec::new()).await.unwrap();

        refresh.assert_async().await;
        exchange.assert_async().await;
        assert_eq!(token.access_token, "at-2");
    }

    #[tokio::test]
    async fn test_save_failure_after_refresh_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = FileTokenStore::new(&path);
        let original = stored("at-old", "rt-original", -60);
        store.save(&original).unwrap();
        std::fs::create_dir(dir.path().join("token.json.tmp")).unwrap();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-new","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;
        let prompt = ScriptedPrompt::answering(true);
        let resolver = resolver(&server, &store, &prompt, FakeBrowser::silent());

        let err = resolver.resolve_account(&mut Vec::new()).await.unwrap_err();

        assert!(matches!(err, AuthError::Storage { .. }));
        assert_eq!(store.load().unwrap(), StoredToken::Expired(original));
    }
}
