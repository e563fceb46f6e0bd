use std::time::Duration;

use rand::Rng;
use spotify_core::{LIBRARY_READ_SCOPES, OAuthClient, OAuthToken};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use url::Url;

const CALLBACK_READ_TIMEOUT: Duration = Duration::from_secs(10);
const CALLBACK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n\
    <html><body><h2>Spotify connected</h2><p>You can close this tab and return to the terminal.</p></body></html>";

#[derive(Debug, Error)]
pub enum OAuthFlowError {
    #[error("oauth error: {0}")]
    OAuth(#[from] spotify_core::OAuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid redirect uri: {0}")]
    InvalidRedirect(String),
    #[error("authorization code missing in redirect")]
    MissingCode,
    #[error("authorization was denied: {0}")]
    Denied(String),
    #[error("state parameter mismatch in redirect")]
    StateMismatch,
    #[error("authorization timed out")]
    Timeout,
}

/// Authorization-code flow: a loopback listener on the registered redirect
/// URI catches the browser callback; pasting the redirected URL is the fallback.
pub struct OAuthFlow {
    client: OAuthClient,
    redirect_uri: String,
    timeout: Duration,
    force_manual: bool,
}

impl OAuthFlow {
    pub fn new(client: OAuthClient, redirect_uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            redirect_uri: redirect_uri.into(),
            timeout,
            force_manual: env_flag("SPOTIFY_OAUTH_FORCE_MANUAL"),
        }
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, OAuthFlowError> {
        Ok(self
            .client
            .authorize_url(&self.redirect_uri, Some(LIBRARY_READ_SCOPES), Some(state))?)
    }

    pub async fn authenticate(&self) -> Result<OAuthToken, OAuthFlowError> {
        let state = random_state();
        let url = self.authorize_url(&state)?;
        eprintln!("Open this URL in your browser to authorize access:\n\n  {url}\n");

        let code = match self.bind_loopback().await {
            Some(listener) if !self.force_manual => {
                match wait_for_callback(&listener, &state, self.timeout).await {
                    Ok(code) => code,
                    Err(err @ (OAuthFlowError::Denied(_) | OAuthFlowError::StateMismatch)) => {
                        return Err(err);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "loopback callback failed, falling back to manual entry");
                        read_code_from_terminal(&state).await?
                    }
                }
            }
            _ => read_code_from_terminal(&state).await?,
        };

        Ok(self.client.exchange_code(&code, &self.redirect_uri).await?)
    }

    async fn bind_loopback(&self) -> Option<TcpListener> {
        let addr = match loopback_bind_addr(&self.redirect_uri) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!(error = %err, "redirect uri is not a loopback address");
                return None;
            }
        };
        match TcpListener::bind(&addr).await {
            Ok(listener) => Some(listener),
            Err(err) => {
                tracing::warn!(%addr, error = %err, "cannot listen for the oauth callback");
                None
            }
        }
    }
}

/// `host:port` to listen on for a plain-http loopback redirect URI.
fn loopback_bind_addr(redirect_uri: &str) -> Result<String, OAuthFlowError> {
    let url = Url::parse(redirect_uri)
        .map_err(|err| OAuthFlowError::InvalidRedirect(format!("{redirect_uri}: {err}")))?;
    if url.scheme() != "http" {
        return Err(OAuthFlowError::InvalidRedirect(format!(
            "{redirect_uri}: only http loopback redirects can be captured"
        )));
    }
    let host = match url.host_str() {
        Some("localhost") => "127.0.0.1",
        Some(host @ ("127.0.0.1" | "[::1]")) => host,
        other => {
            return Err(OAuthFlowError::InvalidRedirect(format!(
                "{redirect_uri}: host {other:?} is not loopback"
            )));
        }
    };
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

async fn wait_for_callback(
    listener: &TcpListener,
    expected_state: &str,
    timeout: Duration,
) -> Result<String, OAuthFlowError> {
    let (mut stream, _) = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| OAuthFlowError::Timeout)??;

    let mut request = vec![0u8; 8192];
    let read = tokio::time::timeout(CALLBACK_READ_TIMEOUT, stream.read(&mut request))
        .await
        .map_err(|_| OAuthFlowError::Timeout)??;
    let request_text = String::from_utf8_lossy(&request[..read]);

    let _ = stream.write_all(CALLBACK_RESPONSE).await;
    let _ = stream.shutdown().await;

    let url = request_url_from_http_request(&request_text).ok_or(OAuthFlowError::MissingCode)?;
    code_from_redirect(&url, expected_state)
}

async fn read_code_from_terminal(expected_state: &str) -> Result<String, OAuthFlowError> {
    eprint!("Paste the URL you were redirected to (or just the code): ");
    let mut stderr = tokio::io::stderr();
    stderr.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    parse_pasted_code(&line, expected_state)
}

/// Accepts a full redirect URL, a bare query string, or the code itself.
fn parse_pasted_code(input: &str, expected_state: &str) -> Result<String, OAuthFlowError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(OAuthFlowError::MissingCode);
    }
    if let Ok(url) = Url::parse(input) {
        return code_from_redirect(&url, expected_state);
    }
    if input.contains("code=") || input.contains("error=") {
        let query = input.trim_start_matches('?');
        let url = Url::parse(&format!("http://127.0.0.1/?{query}"))
            .map_err(|_| OAuthFlowError::MissingCode)?;
        return code_from_redirect(&url, expected_state);
    }
    Ok(input.to_string())
}

fn code_from_redirect(url: &Url, expected_state: &str) -> Result<String, OAuthFlowError> {
    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }
    if let Some(error) = error {
        return Err(OAuthFlowError::Denied(error));
    }
    if state.as_deref().is_some_and(|state| state != expected_state) {
        return Err(OAuthFlowError::StateMismatch);
    }
    code.ok_or(OAuthFlowError::MissingCode)
}

fn request_url_from_http_request(request: &str) -> Option<Url> {
    let request_line = request.lines().next()?;
    let target = request_line.split_whitespace().nth(1)?;
    if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target).ok()
    } else {
        Url::parse(&format!("http://127.0.0.1{target}")).ok()
    }
}

fn random_state() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:02x}", rng.r#gen::<u8>())).collect()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
