//! In-process HTTP upstream used by tests in place of Google endpoints.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::auth::CredentialManager;
use crate::cloudcode::CloudCodeClient;
use crate::config::{AuthConfig, CloudCodeConfig};
use crate::gateway::GatewayDispatcher;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: hyper::HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl MockResponse {
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn sse(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            body: Bytes::from(body.into()),
        }
    }
}

type Responder = Arc<dyn Fn(&RecordedRequest) -> MockResponse + Send + Sync>;

pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = recorded.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        let responder = responder.clone();
                        async move {
                            let path = req
                                .uri()
                                .path_and_query()
                                .map(|p| p.to_string())
                                .unwrap_or_default();
                            let headers = req.headers().clone();
                            let body = req.into_body().collect().await?.to_bytes();
                            let request = RecordedRequest {
                                path,
                                headers,
                                body,
                            };
                            let reply = responder(&request);
                            recorded.lock().push(request);

                            let mut response = Response::new(Full::new(reply.body));
                            *response.status_mut() =
                                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
                            response.headers_mut().insert(
                                hyper::header::CONTENT_TYPE,
                                hyper::header::HeaderValue::from_static(reply.content_type),
                            );
                            Ok::<_, hyper::Error>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of recorded requests whose path contains `fragment`.
    pub fn count(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path.contains(fragment))
            .count()
    }
}

/// Dispatcher wired to `upstream` with a live environment credential and a
/// fixed project, so only generate and onboarding calls reach the mock.
pub fn test_gateway(upstream: &MockUpstream, dir: &Path) -> GatewayDispatcher {
    let credentials = serde_json::json!({
        "token": "live-token",
        "refresh_token": "refresh",
        "expiry": "2099-01-01T00:00:00Z",
    });
    let auth = AuthConfig {
        client_id: "cid".to_string(),
        client_secret: "secret".to_string(),
        credential_file: dir.join("creds.json"),
        callback_port: 0,
        project_id: Some("proj-1".to_string()),
        env_credentials: Some(credentials.to_string()),
    };
    let cloudcode = CloudCodeConfig {
        endpoint: upstream.url(),
        timeout_secs: 5,
        onboard_poll_interval_secs: 0,
        onboard_max_attempts: 2,
    };
    let api = Arc::new(CloudCodeClient::new(&cloudcode));
    let manager = Arc::new(CredentialManager::new(&auth, &cloudcode, api.clone()));
    GatewayDispatcher::new(manager, api, false)
}
