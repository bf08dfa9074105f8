use crate::format::google::{Candidate, GenerateContentResponse, ResponsePart, UsageMetadata};
use crate::format::openai::{
    ChatCompletionChunk, ChatCompletionResponse, ChatUsage, Choice, ChunkChoice, Delta,
    FinishReason, ResponseMessage,
};

const DEFAULT_IMAGE_MIME: &str = "image/png";

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn convert_finish_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "STOP" => Some(FinishReason::Stop),
        "MAX_TOKENS" => Some(FinishReason::Length),
        "SAFETY" | "RECITATION" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

pub fn convert_usage(usage: &UsageMetadata) -> ChatUsage {
    let completion_tokens = usage.candidates_token_count + usage.thoughts_token_count;
    let total_tokens = if usage.total_token_count > 0 {
        usage.total_token_count
    } else {
        usage.prompt_token_count + completion_tokens
    };
    ChatUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens,
        total_tokens,
    }
}

/// Visible and reasoning text extracted from one candidate.
#[derive(Debug, Default, PartialEq)]
struct CandidateText {
    role: String,
    content: String,
    reasoning: String,
}

fn extract_candidate(candidate: &Candidate) -> CandidateText {
    let Some(content) = &candidate.content else {
        return CandidateText {
            role: "assistant".to_string(),
            ..Default::default()
        };
    };

    let role = match content.role.as_deref() {
        Some("model") | None => "assistant".to_string(),
        Some(other) => other.to_string(),
    };

    let mut visible: Vec<String> = Vec::new();
    let mut reasoning = String::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            if part.thought {
                reasoning.push_str(text);
            } else {
                visible.push(text.clone());
            }
        } else if let Some(image) = embed_image(part) {
            visible.push(image);
        }
    }

    CandidateText {
        role,
        content: visible.join("\n\n"),
        reasoning,
    }
}

/// Re-embeds an inline image part as a markdown data URI.
fn embed_image(part: &ResponsePart) -> Option<String> {
    let inline = part.inline_data.as_ref()?;
    if inline.data.is_empty() {
        return None;
    }
    let mime = if inline.mime_type.is_empty() {
        DEFAULT_IMAGE_MIME
    } else {
        inline.mime_type.as_str()
    };
    mime.starts_with("image/")
        .then(|| format!("![image](data:{};base64,{})", mime, inline.data))
}

pub fn convert_response(response: &GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .map(|candidate| {
            let text = extract_candidate(candidate);
            Choice {
                index: candidate.index.unwrap_or(0),
                message: ResponseMessage {
                    role: text.role,
                    content: text.content,
                    reasoning_content: (!text.reasoning.is_empty()).then_some(text.reasoning),
                },
                finish_reason: candidate
                    .finish_reason
                    .as_deref()
                    .and_then(convert_finish_reason),
            }
        })
        .collect();

    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: now_unix(),
        model: model.to_string(),
        choices,
        usage: response.usage_metadata.as_ref().map(convert_usage),
    }
}

pub fn convert_chunk(
    response: &GenerateContentResponse,
    model: &str,
    id: &str,
    created: i64,
) -> ChatCompletionChunk {
    let choices = response
        .candidates
        .iter()
        .map(|candidate| {
            let text = extract_candidate(candidate);
            ChunkChoice {
                index: candidate.index.unwrap_or(0),
                delta: Delta {
                    content: (!text.content.is_empty()).then_some(text.content),
                    reasoning_content: (!text.reasoning.is_empty()).then_some(text.reasoning),
                },
                finish_reason: candidate
                    .finish_reason
                    .as_deref()
                    .and_then(convert_finish_reason),
            }
        })
        .collect();

    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices,
        usage: response.usage_metadata.as_ref().map(convert_usage),
    }
}
