use serde::Deserialize;

use super::oauth::{OAuthClient, percent_encode};
use crate::error::{AuthError, Error, Result};

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Token endpoint reply for both the code exchange and refresh grants.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

pub async fn refresh_access_token(
    http_client: &super::HttpClient,
    oauth: &OAuthClient,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let body = format!(
        "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
        percent_encode(&oauth.client_id),
        percent_encode(&oauth.client_secret),
        percent_encode(refresh_token)
    );

    let response = http_client
        .post(
            &oauth.token_url,
            "application/x-www-form-urlencoded",
            body.as_bytes(),
        )
        .await
        .map_err(|e| Error::Auth(AuthError::RefreshFailed(e)))?;

    serde_json::from_slice(&response)
        .map_err(|e| Error::Auth(AuthError::RefreshFailed(format!("invalid token response: {}", e))))
}
