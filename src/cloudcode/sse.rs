use futures_util::{Stream, StreamExt};
use hyper::body::Bytes;
use serde_json::{Value, json};
use std::fmt::Display;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::format::google::{GenerateContentResponse, unwrap_envelope};
use crate::format::to_openai::{completion_id, convert_chunk, now_unix};

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Output dialect of a relay.
#[derive(Debug, Clone)]
pub enum RelayMode {
    /// `chat.completion.chunk` frames sharing one id and timestamp.
    OpenAi {
        model: String,
        id: String,
        created: i64,
    },
    /// Unwrapped Gemini responses passed through unchanged.
    Native,
}

impl RelayMode {
    pub fn openai(model: impl Into<String>) -> Self {
        RelayMode::OpenAi {
            model: model.into(),
            id: completion_id(),
            created: now_unix(),
        }
    }
}

/// Re-frames the remote `alt=sse` stream one event at a time.
///
/// Each call to [`Relay::next_frame`] reads just enough of the remote body to
/// produce the next outbound `data: ...\n\n` frame. The sequence ends on clean
/// exhaustion, or right after the single error frame emitted when the remote
/// read fails. The `[DONE]` sentinel is left to the caller.
pub struct Relay {
    body: ByteStream,
    buffer: Vec<u8>,
    mode: RelayMode,
    exhausted: bool,
    failed: bool,
    frames: usize,
}

impl Relay {
    pub fn new<S, E>(body: S, mode: RelayMode) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display,
    {
        Self {
            body: Box::pin(body.map(|chunk| chunk.map_err(|e| e.to_string()))),
            buffer: Vec::with_capacity(4096),
            mode,
            exhausted: false,
            failed: false,
            frames: 0,
        }
    }

    /// Number of frames produced so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Whether the sequence ended on a remote read failure.
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if let Some(line) = self.next_line() {
                if let Some(frame) = self.decode_line(&line) {
                    self.frames += 1;
                    return Some(frame);
                }
                continue;
            }
            if self.exhausted {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!(error = %e, frames = self.frames, "Upstream stream failed");
                    self.exhausted = true;
                    self.failed = true;
                    self.buffer.clear();
                    self.frames += 1;
                    return Some(error_frame(&format!("Streaming error: {}", e)));
                }
                None => self.exhausted = true,
            }
        }
    }

    /// Pops the next complete line; once the body is exhausted a trailing
    /// unterminated line is returned as well.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => Some(self.buffer.drain(..=pos).collect()),
            None if self.exhausted && !self.buffer.is_empty() => {
                Some(std::mem::take(&mut self.buffer))
            }
            None => None,
        }
    }

    fn decode_line(&self, raw: &[u8]) -> Option<Bytes> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches(['\r', '\n']),
            Err(e) => {
                warn!(error = %e, "Skipping stream line with invalid UTF-8");
                return None;
            }
        };
        let data = line.strip_prefix("data:")?.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable stream event");
                return None;
            }
        };
        let value = unwrap_envelope(value);

        // Remote error events are forwarded untouched in either mode.
        if value.get("error").is_some() {
            return Some(frame(&value.to_string()));
        }

        match &self.mode {
            RelayMode::Native => Some(frame(&value.to_string())),
            RelayMode::OpenAi { model, id, created } => {
                let response: GenerateContentResponse = match serde_json::from_value(value) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Skipping stream event with unexpected shape");
                        return None;
                    }
                };
                let chunk = convert_chunk(&response, model, id, *created);
                match serde_json::to_string(&chunk) {
                    Ok(json) => Some(frame(&json)),
                    Err(e) => {
                        debug!(error = %e, "Failed to encode chunk");
                        None
                    }
                }
            }
        }
    }
}

fn frame(json: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", json))
}

/// Terminal in-stream error event.
pub fn error_frame(message: &str) -> Bytes {
    let body = json!({
        "error": {
            "message": message,
            "type": "api_error",
            "code": 500
        }
    });
    frame(&body.to_string())
}

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
