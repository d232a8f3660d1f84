//! Loopback HTTP listener that captures the authorization redirect
//!
//! Binds the host:port named by the redirect URI, answers the first
//! request on the redirect path that carries `code` or `error`, then
//! closes the socket. Anything else (favicon probes, stray paths) gets
//! a 404 and does not consume the callback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use url::Url;

use super::AuthError;

const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Idle connections (browser preconnects) are dropped after this.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome carried by the redirect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationResult {
    Code(String),
    Denied(String),
}

impl AuthorizationResult {
    pub fn into_code(self) -> Result<String, AuthError> {
        match self {
            Self::Code(code) => Ok(code),
            Self::Denied(reason) => Err(AuthError::AuthorizationDenied { reason }),
        }
    }
}

pub struct RedirectListener {
    listener: TcpListener,
    route: Arc<CallbackRoute>,
}

/// What a request must look like to count as the callback.
struct CallbackRoute {
    path: String,
    expected_state: Option<String>,
}

impl RedirectListener {
    /// Bind the address encoded in `redirect_uri`. Returns once the socket
    /// is accepting, so the browser may be launched right after.
    pub async fn bind(redirect_uri: &str) -> Result<Self, AuthError> {
        let url = Url::parse(redirect_uri)
            .map_err(|e| AuthError::InvalidParams(format!("redirect URI: {}", e)))?;
        if url.scheme() != "http" {
            return Err(AuthError::InvalidParams(format!(
                "redirect URI must use http, got {}",
                url.scheme()
            )));
        }
        let host = match url.host_str() {
            Some("localhost") => "127.0.0.1",
            Some(host) => host.trim_start_matches('[').trim_end_matches(']'),
            None => {
                return Err(AuthError::InvalidParams(
                    "redirect URI has no host".to_string(),
                ))
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| AuthError::listener("bind the redirect address", e))?;
        let this = Self {
            listener,
            route: Arc::new(CallbackRoute {
                path: url.path().to_string(),
                expected_state: None,
            }),
        };
        tracing::debug!(
            "Redirect listener bound on {} for path {}",
            this.local_addr()?,
            this.route.path
        );
        Ok(this)
    }

    /// Reject callbacks whose `state` parameter differs from `state`.
    pub fn with_state(self, state: impl Into<String>) -> Self {
        let route = CallbackRoute {
            path: self.route.path.clone(),
            expected_state: Some(state.into()),
        };
        Self {
            listener: self.listener,
            route: Arc::new(route),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AuthError> {
        self.listener
            .local_addr()
            .map_err(|e| AuthError::listener("read the bound address", e))
    }

    /// Block until the callback arrives, the timeout fires, or Ctrl-C.
    /// The socket is closed before this returns in every case.
    pub async fn listen(self, timeout: Duration) -> Result<String, AuthError> {
        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, self.accept_callback()) => match res {
                Ok(result) => result,
                Err(_) => Err(AuthError::AuthorizationTimeout { waited: timeout }),
            },
            _ = tokio::signal::ctrl_c() => Err(AuthError::Cancelled),
        };
        drop(self);

        match &outcome {
            Ok(AuthorizationResult::Code(_)) => tracing::info!("Authorization code received"),
            Ok(AuthorizationResult::Denied(reason)) => {
                tracing::warn!("Authorization denied: {}", reason)
            }
            Err(e) => tracing::warn!("Redirect listener stopped: {}", e),
        }
        outcome?.into_code()
    }

    /// Each connection is served on its own task so an idle socket cannot
    /// hold up the real callback. Dropping the set aborts the stragglers.
    async fn accept_callback(&self) -> Result<AuthorizationResult, AuthError> {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (mut stream, peer) =
                        accepted.map_err(|e| AuthError::listener("accept a connection", e))?;
                    let route = Arc::clone(&self.route);
                    handlers.spawn(async move {
                        match route.handle(&mut stream).await {
                            Ok(result) => result,
                            Err(e) => {
                                tracing::debug!("Dropping request from {}: {}", peer, e);
                                None
                            }
                        }
                    });
                }
                Some(joined) = handlers.join_next() => {
                    if let Ok(Some(result)) = joined {
                        return Ok(result);
                    }
                }
            }
        }
    }
}

impl CallbackRoute {
    async fn handle(&self, stream: &mut TcpStream) -> std::io::Result<Option<AuthorizationResult>> {
        let head = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request_head(stream))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "no request received")
            })??;
        let Some((method, target)) = parse_request_line(&head) else {
            respond(stream, "400 Bad Request", "Malformed request").await?;
            return Ok(None);
        };
        if method != "GET" {
            respond(stream, "405 Method Not Allowed", "Only GET is supported").await?;
            return Ok(None);
        }

        let Ok(url) = Url::parse(&format!("http://localhost{}", target)) else {
            respond(stream, "400 Bad Request", "Malformed request target").await?;
            return Ok(None);
        };
        if url.path() != self.path {
            respond(stream, "404 Not Found", "Not found").await?;
            return Ok(None);
        }

        match self.extract(&url) {
            Some(AuthorizationResult::Code(code)) => {
                respond(
                    stream,
                    "200 OK",
                    "Sign-in complete. You can close this tab and return to the terminal.",
                )
                .await?;
                Ok(Some(AuthorizationResult::Code(code)))
            }
            Some(AuthorizationResult::Denied(reason)) => {
                respond(
                    stream,
                    "400 Bad Request",
                    "Sign-in failed. You can close this tab; details are shown in the terminal.",
                )
                .await?;
                Ok(Some(AuthorizationResult::Denied(reason)))
            }
            None => {
                respond(stream, "400 Bad Request", "Missing code or error parameter").await?;
                Ok(None)
            }
        }
    }

    fn extract(&self, url: &Url) -> Option<AuthorizationResult> {
        let mut code = None;
        let mut error = None;
        let mut description = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            let reason = match description {
                Some(desc) if !desc.is_empty() => format!("{}: {}", error, desc),
                _ => error,
            };
            return Some(AuthorizationResult::Denied(reason));
        }

        let code = code.filter(|c| !c.is_empty())?;
        if let Some(expected) = &self.expected_state {
            if state.as_deref() != Some(expected.as_str()) {
                return Some(AuthorizationResult::Denied(
                    "state mismatch in authorization callback".to_string(),
                ));
            }
        }
        Some(AuthorizationResult::Code(code))
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_HEAD {
            break;
        }
    }
    if buf.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before request",
        ));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `GET /path?query HTTP/1.1` -> ("GET", "/path?query")
fn parse_request_line(head: &str) -> Option<(&str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    target.starts_with('/').then_some((method, target))
}

async fn respond(stream: &mut TcpStream, status: &str, message: &str) -> std::io::Result<()> {
    let body = format!(
        "<!DOCTYPE html><html><head><title>cnote</title></head><body><p>{}</p></body></html>",
        message
    );
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
