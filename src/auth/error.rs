//! Error taxonomy for the authorization subsystem

use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Persisted token could not be read or written.
    #[error("token storage failed while {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: BoxError,
    },

    /// The user or the identity provider rejected consent.
    #[error("authorization was denied: {reason}")]
    AuthorizationDenied { reason: String },

    #[error("no authorization callback arrived within {} seconds", .waited.as_secs())]
    AuthorizationTimeout { waited: Duration },

    #[error("could not exchange the authorization code for a token: {0}")]
    TokenExchangeFailed(String),

    #[error("your session expired and the refresh token was rejected: {0}")]
    RefreshFailed(String),

    #[error("account setup was declined")]
    SetupDeclined,

    #[error("redirect listener failed to {op}: {source}")]
    Listener {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("authorization cancelled")]
    Cancelled,

    #[error("invalid OAuth configuration: {0}")]
    InvalidParams(String),

    #[error("terminal I/O failed: {0}")]
    Terminal(#[source] std::io::Error),
}

impl AuthError {
    pub fn storage(op: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            op,
            source: source.into(),
        }
    }

    pub fn listener(op: &'static str, source: std::io::Error) -> Self {
        Self::Listener { op, source }
    }
}
