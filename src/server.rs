use base64::Engine;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::auth::oauth::parse_query;
use crate::cloudcode::Relay;
use crate::cloudcode::sse::DONE_FRAME;
use crate::error::{ApiError, AuthError, Error};
use crate::format::{ChatCompletionRequest, extract_model_from_path};
use crate::gateway::{Dispatch, GatewayDispatcher};
use crate::models::{native_model_list, openai_model_list};

/// Maximum request body size (20 MB, room for inline images).
const MAX_REQUEST_SIZE: usize = 20 * 1024 * 1024;

pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Shared server state passed to all request handlers.
pub struct ServerState {
    pub gateway: GatewayDispatcher,
    /// Inbound password; `None` leaves every route open.
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub log_requests: bool,
}

/// Handle an incoming TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_request(req, state, remote_addr).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = generate_request_id();

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "Received request"
    );

    if method == Method::OPTIONS {
        return Ok(with_cors(preflight_response()));
    }

    let start = std::time::Instant::now();

    let open_route = matches!(path.as_str(), "/" | "/health");
    if !open_route
        && let Some(expected) = &state.api_key
        && !is_authorized(&req, expected)
    {
        warn!(
            remote = %remote_addr,
            request_id = %request_id,
            "Unauthorized request - invalid API key"
        );
        return Ok(with_cors(error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid authentication credentials. Use HTTP Basic Auth, a Bearer token, the 'key' query parameter, or the 'x-goog-api-key' header",
            "authentication_error",
            &request_id,
        )));
    }

    let request_timeout = state.request_timeout;
    let result = match tokio::time::timeout(request_timeout, async {
        match (method.clone(), path.as_str()) {
            (Method::POST, "/v1/chat/completions") => {
                handle_chat_completions(req, &state, &request_id).await
            }

            (Method::GET, "/v1/models") => Ok(json_ok(&openai_model_list(), &request_id)),
            (Method::GET, "/v1beta/models") => Ok(json_ok(&native_model_list(), &request_id)),

            (Method::POST, p) if p.starts_with("/v1beta/models/") => {
                handle_native(req, &state, &request_id).await
            }

            (Method::GET, "/health") => Ok(json_ok(
                &json!({"status": "healthy", "service": "cagw"}),
                &request_id,
            )),
            (Method::GET, "/") => Ok(json_ok(&service_info(), &request_id)),

            _ => Ok(error_response(
                StatusCode::NOT_FOUND,
                "Not found",
                "not_found",
                &request_id,
            )),
        }
    })
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(request_id = %request_id, "Request timed out");
            Err(Error::Timeout(request_timeout))
        }
    };

    let duration = start.elapsed();

    let response = match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status >= 400 {
                warn!(
                    method = %method,
                    path = %path,
                    status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request failed"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request completed"
                );
            }
            resp
        }
        Err(e) => {
            let resp = error_to_response(&e, &request_id);
            warn!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %e,
                "Request error"
            );
            resp
        }
    };

    Ok(with_cors(response))
}

fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// Accepts the password from `?key=`, `x-goog-api-key`, a Bearer token, or
/// the password half of HTTP Basic credentials.
fn is_authorized(req: &Request<Incoming>, expected: &str) -> bool {
    if let Some(query) = req.uri().query()
        && parse_query(query).get("key").map(String::as_str) == Some(expected)
    {
        return true;
    }

    if header_str(req, "x-goog-api-key") == Some(expected) {
        return true;
    }

    let Some(authorization) = header_str(req, "authorization") else {
        return false;
    };
    if let Some(token) = authorization.strip_prefix("Bearer ") {
        return token == expected;
    }
    if let Some(encoded) = authorization.strip_prefix("Basic ") {
        return base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|creds| {
                creds
                    .split_once(':')
                    .map(|(_, password)| password == expected)
            })
            .unwrap_or(false);
    }
    false
}

fn header_str<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn handle_chat_completions(
    req: Request<Incoming>,
    state: &ServerState,
    request_id: &str,
) -> Result<Response<ResponseBody>, Error> {
    let body = read_body_limited(req.into_body(), MAX_REQUEST_SIZE).await?;
    let request: ChatCompletionRequest = serde_json::from_slice(&body)?;
    validate_chat_request(&request)?;

    if state.log_requests {
        info!(request_id = %request_id, "Chat request:\n{}", String::from_utf8_lossy(&body));
    }

    match state.gateway.chat(request).await? {
        Dispatch::Completed(response) => Ok(json_ok(&response, request_id)),
        Dispatch::Streaming(relay) => Ok(stream_response(relay, true, request_id)),
    }
}

async fn handle_native(
    req: Request<Incoming>,
    state: &ServerState,
    request_id: &str,
) -> Result<Response<ResponseBody>, Error> {
    let path = req.uri().path().to_string();
    let streaming = path.contains("streamGenerateContent");
    if !streaming && !path.contains("generateContent") {
        return Ok(error_response(
            StatusCode::NOT_FOUND,
            "Not found",
            "not_found",
            request_id,
        ));
    }

    let Some(model) = extract_model_from_path(&path) else {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: format!("Could not extract model name from path: {}", path),
        }));
    };
    let model = model.to_string();

    let body = read_body_limited(req.into_body(), MAX_REQUEST_SIZE).await?;
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &body
    };

    if state.log_requests {
        info!(request_id = %request_id, model = %model, "Native request:\n{}", String::from_utf8_lossy(body));
    }

    match state.gateway.native(&model, body, streaming).await? {
        Dispatch::Completed(value) => Ok(json_ok(&value, request_id)),
        Dispatch::Streaming(relay) => Ok(stream_response(relay, false, request_id)),
    }
}

fn validate_chat_request(req: &ChatCompletionRequest) -> Result<(), Error> {
    if req.model.is_empty() {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: "model is required".to_string(),
        }));
    }

    if req.messages.is_empty() {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: "messages array cannot be empty".to_string(),
        }));
    }

    Ok(())
}

async fn read_body_limited(body: Incoming, max_size: usize) -> Result<Bytes, Error> {
    match Limited::new(body, max_size).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            Err(Error::Api(ApiError::RequestTooLarge {
                size: max_size + 1,
                max: max_size,
            }))
        }
        Err(e) => Err(Error::Http(e.to_string())),
    }
}

/// Drives `relay` from its own task and streams its frames to the client.
///
/// The channel holds one frame, so a slow client stalls the relay instead of
/// buffering the remote stream. Once the client goes away the task ends and
/// drops the relay, closing the remote body even while it is idle.
fn stream_response(mut relay: Relay, append_done: bool, request_id: &str) -> Response<ResponseBody> {
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    let id = request_id.to_string();

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => None,
                frame = relay.next_frame() => Some(frame),
            };
            let Some(frame) = next else {
                debug!(request_id = %id, frames = relay.frames(), "Client disconnected mid-stream");
                return;
            };
            let Some(frame) = frame else {
                break;
            };
            if tx.send(frame).await.is_err() {
                debug!(request_id = %id, frames = relay.frames(), "Client disconnected mid-stream");
                return;
            }
        }
        if append_done && !relay.failed() {
            let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
        }
        debug!(request_id = %id, frames = relay.frames(), failed = relay.failed(), "Stream finished");
    });

    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(Frame::data(frame)));
    let mut response = Response::new(BodyExt::boxed(StreamBody::new(stream)));
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(hyper::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("keep-alive"));
    insert_request_id(&mut response, request_id);
    response
}

fn service_info() -> serde_json::Value {
    json!({
        "name": "cagw",
        "description": "OpenAI-compatible gateway for Gemini models served through Google Code Assist",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "openai_compatible": {
                "chat_completions": "/v1/chat/completions",
                "models": "/v1/models"
            },
            "native_gemini": {
                "models": "/v1beta/models",
                "generate": "/v1beta/models/{model}:generateContent",
                "stream": "/v1beta/models/{model}:streamGenerateContent"
            },
            "health": "/health"
        }
    })
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).boxed()
}

fn insert_request_id(response: &mut Response<ResponseBody>, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
}

fn json_response(status: StatusCode, body: String, request_id: &str) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    insert_request_id(&mut response, request_id);
    response
}

fn json_ok<T: serde::Serialize>(value: &T, request_id: &str) -> Response<ResponseBody> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body, request_id),
        Err(e) => error_to_response(&Error::Json(e), request_id),
    }
}

fn error_response(
    status: StatusCode,
    message: &str,
    error_type: &str,
    request_id: &str,
) -> Response<ResponseBody> {
    let body = json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": status.as_u16()
        }
    });
    json_response(status, body.to_string(), request_id)
}

fn preflight_response() -> Response<ResponseBody> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        hyper::header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

fn with_cors(mut response: Response<ResponseBody>) -> Response<ResponseBody> {
    response.headers_mut().insert(
        hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn error_to_response(error: &Error, request_id: &str) -> Response<ResponseBody> {
    let (status, error_type, message) = match error {
        Error::Auth(
            e @ (AuthError::CredentialsUnavailable
            | AuthError::AuthFailed(_)
            | AuthError::RefreshFailed(_)),
        ) => (StatusCode::UNAUTHORIZED, "authentication_error", e.to_string()),
        Error::Auth(e @ AuthError::OnboardingTimeout { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, "api_error", e.to_string())
        }
        Error::Auth(e) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", e.to_string()),
        Error::Translation(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg.clone()),
        Error::Api(ApiError::Upstream { status, message }) => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            "api_error",
            message.clone(),
        ),
        Error::Api(ApiError::InvalidRequest { message }) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message.clone(),
        ),
        Error::Api(ApiError::RequestTooLarge { max, .. }) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_request_error",
            format!("Request body too large (max: {} bytes)", max),
        ),
        Error::Stream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", msg.clone()),
        Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", e.to_string()),
        Error::Json(e) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("Invalid JSON in request body: {}", e),
        ),
        Error::Http(msg) => (StatusCode::BAD_GATEWAY, "api_error", msg.clone()),
        Error::Timeout(d) => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout_error",
            format!("Request timed out after {:?}", d),
        ),
    };

    let message = match error.suggestion() {
        Some(suggestion) => format!("{}. {}", message, suggestion),
        None => message,
    };

    error_response(status, &message, error_type, request_id)
}
