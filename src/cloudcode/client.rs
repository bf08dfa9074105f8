use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CloudCodeConfig;
use crate::error::{Error, Result};

/// HTTP transport for the Code Assist `v1internal` surface.
///
/// Failed calls are surfaced as-is; nothing here retries.
pub struct CloudCodeClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
    endpoint: String,
    api_timeout: Duration,
}

impl CloudCodeClient {
    pub fn new(config: &CloudCodeConfig) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/v1internal:{}", self.endpoint, method)
    }

    /// Non-streaming generate call; returns the raw response body.
    pub async fn generate_content(&self, body: Bytes, access_token: &str) -> Result<Bytes> {
        let headers = super::request::build_headers(access_token, false);
        let url = self.method_url("generateContent");

        debug!(url = %url, "Sending generateContent");

        match tokio::time::timeout(self.api_timeout, self.post(&url, &headers, body)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("generateContent timed out");
                Err(Error::Timeout(self.api_timeout))
            }
        }
    }

    /// Streaming generate call. Only the response head is awaited; the body
    /// is handed back unread for the relay to consume.
    pub async fn stream_generate_content(
        &self,
        body: Bytes,
        access_token: &str,
    ) -> Result<hyper::Response<Incoming>> {
        let headers = super::request::build_headers(access_token, true);
        let url = self.method_url("streamGenerateContent?alt=sse");

        debug!(url = %url, "Sending streamGenerateContent");

        let response =
            match tokio::time::timeout(self.api_timeout, self.post_raw(&url, &headers, body)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("streamGenerateContent timed out waiting for response headers");
                    return Err(Error::Timeout(self.api_timeout));
                }
            };
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        Err(upstream_error(status, &body))
    }

    /// JSON request/response call used for discovery and onboarding.
    pub async fn call<Req, Resp>(&self, method: &str, payload: &Req, access_token: &str) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let headers = super::request::build_headers(access_token, false);
        let body = Bytes::from(serde_json::to_vec(payload)?);
        let url = self.method_url(method);

        debug!(method, "Calling Code Assist");

        let bytes = match tokio::time::timeout(self.api_timeout, self.post(&url, &headers, body)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout(self.api_timeout)),
        };

        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(Cow<'static, str>, Cow<'static, str>)],
        body: Bytes,
    ) -> Result<Bytes> {
        let response = self.post_raw(url, headers, body).await?;
        let status = response.status();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), &body));
        }

        Ok(body)
    }

    async fn post_raw(
        &self,
        url: &str,
        headers: &[(Cow<'static, str>, Cow<'static, str>)],
        body: Bytes,
    ) -> Result<hyper::Response<Incoming>> {
        let mut req = Request::builder().method("POST").uri(url);

        for (name, value) in headers {
            req = req.header(name.as_ref(), value.as_ref());
        }

        let req = req
            .body(Full::new(body))
            .map_err(|e| Error::Http(e.to_string()))?;

        self.client
            .request(req)
            .await
            .map_err(|e| Error::Http(e.to_string()))
    }
}

/// Builds an upstream error, preferring the `error.message` field of a
/// Google error body over the raw text.
pub(crate) fn upstream_error(status: u16, body: &[u8]) -> Error {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }

    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        #[serde(default)]
        message: String,
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|b| b.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                format!("upstream returned HTTP {}", status)
            } else {
                text.chars().take(500).collect()
            }
        });

    Error::upstream(status, message)
}
