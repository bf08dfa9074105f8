pub mod credentials;
pub mod manager;
pub mod oauth;
pub mod token;

pub use credentials::{Credential, CredentialOrigin};
pub use manager::{AccessContext, CredentialManager};

use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Minimal HTTP client for the OAuth token endpoint.
pub struct HttpClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { client }
    }

    /// POST a body, returning the response bytes on 2xx.
    ///
    /// Non-success responses are returned as `Err("HTTP <status>: <body>")`.
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, String> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", content_type)
            .header("Accept", "application/json")
            .body(Full::new(Bytes::from(body.to_vec())))
            .map_err(|e| e.to_string())?;

        let response = self.client.request(req).await.map_err(|e| e.to_string())?;
        let status = response.status();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?
            .to_bytes();

        if !status.is_success() {
            return Err(format!(
                "HTTP {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body).trim()
            ));
        }

        Ok(body.to_vec())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
