//! End-to-end handling of one chat or native request: credentials, payload,
//! remote call, then translation or relay.

use http_body_util::BodyExt;
use hyper::body::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{AccessContext, CredentialManager};
use crate::cloudcode::{CloudCodeClient, CloudCodeRequest, Relay, RelayMode};
use crate::error::Result;
use crate::format::{
    ChatCompletionRequest, ChatCompletionResponse, GenerateContentResponse, NativeRequest,
    convert_request, convert_response, prepare_native_request, unwrap_envelope,
};
use crate::models::{base_name_of, find_model};

/// Result of a dispatched request.
pub enum Dispatch<T> {
    Completed(T),
    Streaming(Relay),
}

impl<T> std::fmt::Debug for Dispatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Completed(_) => f.write_str("Completed"),
            Dispatch::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

pub struct GatewayDispatcher {
    credentials: Arc<CredentialManager>,
    api: Arc<CloudCodeClient>,
    log_requests: bool,
}

impl GatewayDispatcher {
    pub fn new(
        credentials: Arc<CredentialManager>,
        api: Arc<CloudCodeClient>,
        log_requests: bool,
    ) -> Self {
        Self {
            credentials,
            api,
            log_requests,
        }
    }

    /// OpenAI chat completion, streamed or buffered per `request.stream`.
    pub async fn chat(&self, request: ChatCompletionRequest) -> Result<Dispatch<ChatCompletionResponse>> {
        let payload = convert_request(&request)?;
        let context = self.context().await?;
        let body = self.envelope(&request.model, &context, payload)?;

        info!(
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "Dispatching chat completion"
        );

        if request.stream {
            let response = self
                .api
                .stream_generate_content(body, &context.access_token)
                .await?;
            let relay = Relay::new(
                response.into_body().into_data_stream(),
                RelayMode::openai(&request.model),
            );
            return Ok(Dispatch::Streaming(relay));
        }

        let bytes = self.api.generate_content(body, &context.access_token).await?;
        let value = unwrap_envelope(serde_json::from_slice::<Value>(&bytes)?);
        let response: GenerateContentResponse = serde_json::from_value(value)?;
        Ok(Dispatch::Completed(convert_response(&response, &request.model)))
    }

    /// Native Gemini generate call for `model`, with gateway policy applied
    /// to the caller's body.
    pub async fn native(&self, model: &str, body: &[u8], streaming: bool) -> Result<Dispatch<Value>> {
        let request: NativeRequest = serde_json::from_slice(body)?;
        let request = prepare_native_request(request, model);
        let context = self.context().await?;
        let body = self.envelope(model, &context, request)?;

        info!(model, stream = streaming, "Dispatching native request");

        if streaming {
            let response = self
                .api
                .stream_generate_content(body, &context.access_token)
                .await?;
            let relay = Relay::new(response.into_body().into_data_stream(), RelayMode::Native);
            return Ok(Dispatch::Streaming(relay));
        }

        let bytes = self.api.generate_content(body, &context.access_token).await?;
        Ok(Dispatch::Completed(unwrap_envelope(serde_json::from_slice(&bytes)?)))
    }

    async fn context(&self) -> Result<AccessContext> {
        self.credentials.ensure_ready(false).await
    }

    fn envelope<R: Serialize>(&self, model: &str, context: &AccessContext, request: R) -> Result<Bytes> {
        let base = base_name_of(model);
        if find_model(model).is_none() {
            debug!(model, "Model not in catalog, forwarding as-is");
        }

        let envelope = CloudCodeRequest::new(base, context.project_id.as_str(), request);
        if self.log_requests
            && let Ok(json) = serde_json::to_string_pretty(&envelope.request)
        {
            info!(model = base, "Upstream request:\n{}", json);
        }
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }
}
