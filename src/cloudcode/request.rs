use serde::Serialize;
use std::borrow::Cow;
use std::sync::LazyLock;

pub const CLIENT_NAME: &str = "cagw";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}/{} ({}; {})",
        CLIENT_NAME,
        CLIENT_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// Envelope every `v1internal` generate call is wrapped in.
#[derive(Debug, Clone, Serialize)]
pub struct CloudCodeRequest<R> {
    pub model: String,
    pub project: String,
    pub request: R,
}

impl<R: Serialize> CloudCodeRequest<R> {
    pub fn new(model: impl Into<String>, project: impl Into<String>, request: R) -> Self {
        Self {
            model: model.into(),
            project: project.into(),
            request,
        }
    }
}

pub fn build_headers(
    access_token: &str,
    streaming: bool,
) -> Vec<(Cow<'static, str>, Cow<'static, str>)> {
    let mut headers = Vec::with_capacity(4);
    headers.push((
        Cow::Borrowed("Authorization"),
        Cow::Owned(format!("Bearer {}", access_token)),
    ));
    headers.push((
        Cow::Borrowed("Content-Type"),
        Cow::Borrowed("application/json"),
    ));
    headers.push((Cow::Borrowed("User-Agent"), Cow::Owned(USER_AGENT.clone())));

    if streaming {
        headers.push((Cow::Borrowed("Accept"), Cow::Borrowed("text/event-stream")));
    }

    headers
}
