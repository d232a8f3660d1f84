//! Fakes shared by the auth tests

use std::sync::atomic::{AtomicUsize, Ordering};

use url::Url;

use super::{AuthError, OAuthParams, SetupPrompt, UrlOpener};

/// Params pointing the token endpoint at `base` and the redirect at a
/// loopback port.
pub fn params_for(base: &str, port: u16) -> OAuthParams {
    OAuthParams::new(
        format!("{}/authorize", base),
        format!("{}/token", base),
        format!("http://127.0.0.1:{}/oauthv2", port),
        "test-client",
        ["offline_access", "Notes.ReadWrite"],
    )
    .unwrap()
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Plays the browser: follows the consent URL back to its redirect_uri
/// with the configured query, echoing the state.
pub struct FakeBrowser {
    reply: Option<String>,
}

impl FakeBrowser {
    pub fn replying(query: &str) -> Self {
        Self {
            reply: Some(query.to_string()),
        }
    }

    pub fn silent() -> Self {
        Self { reply: None }
    }
}

impl UrlOpener for FakeBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        let Some(reply) = &self.reply else {
            return Ok(());
        };

        let url = Url::parse(url).map_err(std::io::Error::other)?;
        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let callback = format!(
            "{}?{}&state={}",
            param("redirect_uri"),
            reply,
            param("state")
        );
        tokio::spawn(async move {
            let _ = reqwest::get(callback).await;
        });
        Ok(())
    }
}

/// Setup prompt with a fixed answer that counts how often it was asked.
pub struct ScriptedPrompt {
    answer: bool,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl SetupPrompt for ScriptedPrompt {
    fn ask_setup_account(&self) -> Result<bool, AuthError> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}
