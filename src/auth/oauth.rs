use base64::Engine;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::token::{TOKEN_URL, TokenResponse};
use crate::config::AuthConfig;
use crate::error::{AuthError, Error, Result};

type CallbackSender =
    Arc<tokio::sync::Mutex<Option<oneshot::Sender<std::result::Result<String, String>>>>>;

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const CALLBACK_PATH: &str = "/oauth-callback";
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

/// OAuth client registration plus the endpoints it talks to.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub callback_port: u16,
}

impl OAuthClient {
    pub fn from_config(auth: &AuthConfig) -> Self {
        Self {
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
            token_url: TOKEN_URL.to_string(),
            callback_port: auth.callback_port,
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.callback_port, CALLBACK_PATH)
    }
}

pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Result<Self> {
        let mut verifier_bytes = [0u8; 32];
        getrandom::fill(&mut verifier_bytes)
            .map_err(|e| Error::Auth(AuthError::AuthFailed(format!("rng failure: {}", e))))?;

        let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Sha256::digest(verifier.as_bytes()));

        Ok(Self {
            verifier,
            challenge,
        })
    }
}

pub fn generate_state() -> Result<String> {
    let mut state_bytes = [0u8; 16];
    getrandom::fill(&mut state_bytes)
        .map_err(|e| Error::Auth(AuthError::AuthFailed(format!("rng failure: {}", e))))?;

    Ok(state_bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

pub fn get_authorization_url(oauth: &OAuthClient, pkce: &Pkce, state: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&code_challenge={}&code_challenge_method=S256&state={}",
        AUTH_URL,
        percent_encode(&oauth.client_id),
        percent_encode(&oauth.redirect_uri()),
        percent_encode(&SCOPES.join(" ")),
        percent_encode(&pkce.challenge),
        percent_encode(state),
    )
}

pub(crate) fn percent_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(b as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", b));
            }
        }
    }
    result
}

pub async fn exchange_code(
    http_client: &super::HttpClient,
    oauth: &OAuthClient,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    debug!("Exchanging authorization code for tokens");

    let body = format!(
        "client_id={}&client_secret={}&code={}&code_verifier={}&grant_type=authorization_code&redirect_uri={}",
        percent_encode(&oauth.client_id),
        percent_encode(&oauth.client_secret),
        percent_encode(code),
        percent_encode(verifier),
        percent_encode(&oauth.redirect_uri()),
    );

    let response = http_client
        .post(
            &oauth.token_url,
            "application/x-www-form-urlencoded",
            body.as_bytes(),
        )
        .await
        .map_err(|e| Error::Auth(AuthError::AuthFailed(format!("token exchange failed: {}", e))))?;

    let tokens: TokenResponse = serde_json::from_slice(&response).map_err(|e| {
        Error::Auth(AuthError::AuthFailed(format!(
            "invalid token response: {}",
            e
        )))
    })?;

    if tokens.refresh_token.as_deref().is_none_or(str::is_empty) {
        return Err(Error::Auth(AuthError::AuthFailed(
            "token response carried no refresh token".to_string(),
        )));
    }

    debug!("Successfully obtained tokens");
    Ok(tokens)
}

/// Runs the browser authorization-code flow end to end.
///
/// Prints the consent URL, waits for the redirect on the fixed callback port
/// and exchanges the code for tokens.
pub async fn authorize_interactive(
    http_client: &super::HttpClient,
    oauth: &OAuthClient,
) -> Result<TokenResponse> {
    if oauth.client_id.is_empty() {
        return Err(Error::Auth(AuthError::AuthFailed(
            "no OAuth client configured (set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET)"
                .to_string(),
        )));
    }

    let pkce = Pkce::generate()?;
    let state = generate_state()?;
    let rx = start_callback_server(oauth.callback_port, state.clone()).await?;
    let url = get_authorization_url(oauth, &pkce, &state);

    let rule = "=".repeat(80);
    println!("\n{rule}\nAUTHENTICATION REQUIRED\n{rule}");
    println!("Please open this URL in your browser to log in:\n{url}\n{rule}\n");

    let code = match tokio::time::timeout(CALLBACK_TIMEOUT, rx).await {
        Ok(Ok(Ok(code))) => code,
        Ok(Ok(Err(reason))) => return Err(Error::Auth(AuthError::AuthFailed(reason))),
        Ok(Err(_)) | Err(_) => {
            return Err(Error::Auth(AuthError::AuthFailed(
                "timed out waiting for the OAuth callback".to_string(),
            )));
        }
    };

    let tokens = exchange_code(http_client, oauth, &code, &pkce.verifier).await?;
    info!("OAuth authorization completed");
    Ok(tokens)
}

pub async fn start_callback_server(
    port: u16,
    expected_state: String,
) -> Result<oneshot::Receiver<std::result::Result<String, String>>> {
    use hyper::Request;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;

    let (tx, rx) = oneshot::channel();
    let tx: CallbackSender = Arc::new(tokio::sync::Mutex::new(Some(tx)));
    let expected_state = Arc::new(expected_state);
    let done = Arc::new(tokio::sync::Notify::new());

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::Auth(AuthError::AuthFailed(format!(
            "failed to bind callback server on port {}: {}",
            port, e
        )))
    })?;

    debug!(port, "OAuth callback server started");

    tokio::spawn(async move {
        let timeout = tokio::time::sleep(CALLBACK_TIMEOUT);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!("OAuth callback server timed out");
                    break;
                }
                _ = done.notified() => {
                    debug!("OAuth callback received, closing listener");
                    break;
                }
                result = listener.accept() => {
                    let (stream, remote_addr) = match result {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    debug!(remote = %remote_addr, "Received callback connection");

                    let io = TokioIo::new(stream);
                    let tx = tx.clone();
                    let expected_state = expected_state.clone();
                    let done = done.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let tx = tx.clone();
                            let expected_state = expected_state.clone();
                            let done = done.clone();
                            async move {
                                let response =
                                    handle_callback(req.uri(), &tx, &expected_state).await;
                                if tx.lock().await.is_none() {
                                    done.notify_one();
                                }
                                Ok::<_, hyper::Error>(response)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(error = %e, "Callback connection error");
                        }
                    });
                }
            }
        }
    });

    Ok(rx)
}

fn html_response(status: StatusCode, title: &str, message: &str) -> Response<Full<Bytes>> {
    let color = if status.is_success() {
        "#28a745"
    } else {
        "#dc3545"
    };
    let html = format!(
        r#"<!DOCTYPE html>
<html><head><title>{title}</title></head>
<body style="font-family: system-ui; padding: 40px; text-align: center;">
<h1 style="color: {color};">{title}</h1>
<p>{message}</p>
<p>You can close this window.</p>
</body></html>"#
    );

    let mut response = Response::new(Full::new(Bytes::from(html)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

async fn handle_callback(
    uri: &hyper::Uri,
    tx: &CallbackSender,
    expected_state: &str,
) -> Response<Full<Bytes>> {
    if uri.path() != CALLBACK_PATH {
        let mut response = Response::new(Full::new(Bytes::from("Not found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let params = parse_query(uri.query().unwrap_or(""));
    let outcome = callback_outcome(&params, expected_state);

    if let Some(sender) = tx.lock().await.take() {
        let _ = sender.send(outcome.clone());
    }

    match outcome {
        Ok(_) => html_response(
            StatusCode::OK,
            "Authentication Successful",
            "Credentials received. Check the gateway logs to confirm onboarding finished.",
        ),
        Err(reason) => html_response(
            StatusCode::BAD_REQUEST,
            "Authentication Failed",
            &html_escape(&reason),
        ),
    }
}

fn callback_outcome(
    params: &HashMap<String, String>,
    expected_state: &str,
) -> std::result::Result<String, String> {
    if let Some(error) = params.get("error") {
        return Err(format!("Error: {}", error));
    }
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err("State mismatch - possible CSRF attack.".to_string());
    }
    match params.get("code") {
        Some(code) if !code.is_empty() => Ok(code.clone()),
        _ => Err("No authorization code received.".to_string()),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) if !k.is_empty() => Some((percent_decode(k), percent_decode(v))),
                _ => None,
            }
        })
        .collect()
}

pub(crate) fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
