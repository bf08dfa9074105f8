use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("invalid request content: {0}")]
    Translation(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns a user-friendly suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Auth(AuthError::CredentialsUnavailable) => {
                Some("Run 'cagw login' or set GEMINI_CREDENTIALS")
            }
            Error::Auth(AuthError::RefreshFailed(_)) => Some("Run 'cagw login' to re-authenticate"),
            Error::Auth(AuthError::AuthFailed(_)) => {
                Some("Check your internet connection and try again")
            }
            Error::Auth(AuthError::ProjectResolutionFailed(_)) => {
                Some("Set GOOGLE_CLOUD_PROJECT to an existing Code Assist project")
            }
            Error::Auth(AuthError::OnboardingTimeout { .. }) => {
                Some("Onboarding is still pending upstream, try again in a few minutes")
            }
            Error::Timeout(_) => Some("Check your internet connection or try again"),
            _ => None,
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Api(ApiError::Upstream {
            status,
            message: message.into(),
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no usable credentials found")]
    CredentialsUnavailable,

    #[error("OAuth flow failed: {0}")]
    AuthFailed(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("project resolution failed: {0}")]
    ProjectResolutionFailed(String),

    #[error("onboarding failed: {0}")]
    OnboardingFailed(String),

    #[error("onboarding did not complete after {attempts} polls")]
    OnboardingTimeout { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("request body too large: {size} bytes (max: {max} bytes)")]
    RequestTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
