use base64::Engine;
use regex_lite::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;
use tracing::warn;

use crate::error::{Error, Result};
use crate::format::google::{
    Content, GenerateContentRequest, GenerationConfig, Part, SafetySetting, ThinkingConfig,
};
use crate::format::openai::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, Role};
use crate::models::{
    DEFAULT_THINKING_BUDGET, include_thoughts, is_image_model, is_search_model, thinking_budget,
};

/// Markdown image reference `![alt](url)`; group 1 is the url.
static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("Invalid markdown image regex")
});

const DEFAULT_IMAGE_MIME: &str = "image/png";

const HARM_CATEGORIES: [&str; 10] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
    "HARM_CATEGORY_IMAGE_DANGEROUS_CONTENT",
    "HARM_CATEGORY_IMAGE_HARASSMENT",
    "HARM_CATEGORY_IMAGE_HATE",
    "HARM_CATEGORY_IMAGE_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_UNSPECIFIED",
];

/// Every harm category with blocking disabled.
pub fn default_safety_settings() -> Vec<SafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|&category| SafetySetting {
            category,
            threshold: "BLOCK_NONE",
        })
        .collect()
}

pub fn google_search_tool() -> Value {
    json!({"googleSearch": {}})
}

/// Thinking settings for a model name, `None` when the model keeps the
/// remote default or is image-only.
pub fn thinking_config_for(model: &str) -> Option<ThinkingConfig> {
    let budget = thinking_budget(model);
    if budget == DEFAULT_THINKING_BUDGET || is_image_model(model) {
        return None;
    }
    Some(ThinkingConfig {
        thinking_budget: budget,
        include_thoughts: include_thoughts(model),
    })
}

pub fn convert_request(request: &ChatCompletionRequest) -> Result<GenerateContentRequest> {
    let contents = request
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>>>()?;

    let mut generation_config = build_generation_config(request);
    generation_config.thinking_config = thinking_config_for(&request.model);
    let generation_config = (generation_config != GenerationConfig::default())
        .then_some(generation_config);

    let tools = is_search_model(&request.model).then(|| vec![google_search_tool()]);

    Ok(GenerateContentRequest {
        contents,
        generation_config,
        safety_settings: default_safety_settings(),
        tools,
    })
}

pub fn map_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        // No system-instruction channel upstream; system turns become user turns.
        Role::System | Role::User => "user",
    }
}

fn convert_message(message: &ChatMessage) -> Result<Content> {
    let parts = match &message.content {
        None => vec![Part::text("")],
        Some(MessageContent::Text(text)) => split_text(text),
        Some(MessageContent::Parts(parts)) => convert_parts(parts)?,
    };
    Ok(Content {
        role: map_role(message.role).to_string(),
        parts,
    })
}

fn convert_parts(parts: &[ContentPart]) -> Result<Vec<Part>> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => {
                if !text.is_empty() {
                    out.extend(split_text(text));
                }
            }
            ContentPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
                Some(part) => out.push(part),
                None => warn!("Dropping image_url part without a base64 data URI"),
            },
            ContentPart::Unsupported => {
                return Err(Error::Translation(
                    "unsupported content part type; expected text or image_url".to_string(),
                ));
            }
        }
    }
    if out.is_empty() {
        out.push(Part::text(""));
    }
    Ok(out)
}

/// Splits text around markdown image references, turning data-URI images into
/// inline parts in place. References that are not decodable data URIs stay as
/// literal text.
pub fn split_text(text: &str) -> Vec<Part> {
    if text.is_empty() {
        return vec![Part::text("")];
    }

    let mut parts = Vec::new();
    let mut last = 0;
    for caps in MARKDOWN_IMAGE.captures_iter(text) {
        let (Some(whole), Some(url)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            parts.push(Part::text(&text[last..whole.start()]));
        }

        let url = url.as_str().trim().trim_matches(|c| c == '"' || c == '\'');
        match parse_data_uri(url) {
            Some(part) => parts.push(part),
            None => parts.push(Part::text(whole.as_str())),
        }
        last = whole.end();
    }
    if last < text.len() {
        parts.push(Part::text(&text[last..]));
    }

    if parts.is_empty() {
        parts.push(Part::text(text));
    }
    parts
}

/// Parses `data:<mime>;base64,<payload>` into an inline part. The payload
/// must be valid standard base64.
pub fn parse_data_uri(url: &str) -> Option<Part> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;

    let mime = header.split(';').next().unwrap_or_default();
    let mime = if mime.is_empty() { DEFAULT_IMAGE_MIME } else { mime };

    base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()
        .map(|_| Part::inline(mime, data))
}

fn build_generation_config(request: &ChatCompletionRequest) -> GenerationConfig {
    let response_mime_type = request
        .response_format
        .as_ref()
        .filter(|f| f.format_type == "json_object")
        .map(|_| "application/json".to_string());

    GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop.clone().map(|s| s.into_vec()),
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        candidate_count: request.n,
        seed: request.seed,
        response_mime_type,
        thinking_config: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_markdown_image_split_in_place() {
        let parts = split_text("A ![x](data:image/png;base64,QQ==) B");
        assert_eq!(
            parts,
            vec![
                Part::text("A "),
                Part::inline("image/png", "QQ=="),
                Part::text(" B"),
            ]
        );
    }

    #[test]
    fn test_markdown_image_non_data_stays_text() {
        let text = "see ![logo](https://example.com/a.png)";
        assert_eq!(
            split_text(text),
            vec![Part::text("see "), Part::text("![logo](https://example.com/a.png)")]
        );

        let bad = "![x](data:image/png;base64,@@@)";
        assert_eq!(split_text(bad), vec![Part::text(bad)]);
    }

    #[test]
    fn test_markdown_image_quoted_url_and_mime() {
        let parts = split_text("![x]( 'data:image/jpeg;base64,QQ==' )");
        assert_eq!(parts, vec![Part::inline("image/jpeg", "QQ==")]);
    }

    #[test]
    fn test_plain_and_empty_text() {
        assert_eq!(split_text("hello"), vec![Part::text("hello")]);
        assert_eq!(split_text(""), vec![Part::text("")]);
    }

    #[test]
    fn test_role_mapping() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "system", "content": "rules"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }));
        let out = convert_request(&req).unwrap();
        let roles: Vec<_> = out.contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, ["user", "user", "model"]);
    }

    #[test]
    fn test_array_content() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/webp;base64,QQ=="}},
                {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}}
            ]}]
        }));
        let out = convert_request(&req).unwrap();
        assert_eq!(
            out.contents[0].parts,
            vec![Part::text("look"), Part::inline("image/webp", "QQ==")]
        );
    }

    #[test]
    fn test_empty_and_null_content() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "user", "content": []},
                {"role": "assistant", "content": null}
            ]
        }));
        let out = convert_request(&req).unwrap();
        assert_eq!(out.contents[0].parts, vec![Part::text("")]);
        assert_eq!(out.contents[1].parts, vec![Part::text("")]);
    }

    #[test]
    fn test_unsupported_part_rejected() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": [
                {"type": "input_audio", "input_audio": {"data": "", "format": "wav"}}
            ]}]
        }));
        assert!(matches!(convert_request(&req), Err(Error::Translation(_))));
    }

    #[test]
    fn test_generation_config_mapping() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "x"}],
            "temperature": 0.2,
            "top_p": 0.9,
            "max_tokens": 256,
            "stop": "END",
            "frequency_penalty": 0.1,
            "presence_penalty": 0.3,
            "n": 2,
            "seed": 7,
            "response_format": {"type": "json_object"}
        }));
        let out = serde_json::to_value(convert_request(&req).unwrap()).unwrap();
        assert_eq!(
            out["generationConfig"],
            json!({
                "temperature": 0.2,
                "topP": 0.9,
                "maxOutputTokens": 256,
                "stopSequences": ["END"],
                "frequencyPenalty": 0.1,
                "presencePenalty": 0.3,
                "candidateCount": 2,
                "seed": 7,
                "responseMimeType": "application/json"
            })
        );
    }

    #[test]
    fn test_absent_parameters_omitted() {
        let req = request(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "x"}],
            "response_format": {"type": "text"}
        }));
        let out = serde_json::to_value(convert_request(&req).unwrap()).unwrap();
        assert!(out.get("generationConfig").is_none());
        assert!(out.get("tools").is_none());
    }

    #[test]
    fn test_safety_settings_always_present() {
        let req = request(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "x"}]
        }));
        let out = convert_request(&req).unwrap();
        assert_eq!(out.safety_settings.len(), 10);
        assert!(out.safety_settings.iter().all(|s| s.threshold == "BLOCK_NONE"));
    }

    #[test]
    fn test_search_variant_adds_tool() {
        let req = request(json!({
            "model": "gemini-2.5-pro-search-maxthinking",
            "messages": [{"role": "user", "content": "x"}]
        }));
        let out = convert_request(&req).unwrap();
        assert_eq!(out.tools, Some(vec![json!({"googleSearch": {}})]));
        assert_eq!(
            out.generation_config.unwrap().thinking_config,
            Some(ThinkingConfig {
                thinking_budget: 32768,
                include_thoughts: true
            })
        );
    }

    #[test]
    fn test_thinking_config_by_variant() {
        assert_eq!(thinking_config_for("gemini-2.5-pro"), None);
        assert_eq!(
            thinking_config_for("gemini-2.5-flash-nothinking"),
            Some(ThinkingConfig {
                thinking_budget: 0,
                include_thoughts: false
            })
        );
        assert_eq!(
            thinking_config_for("gemini-2.5-pro-nothinking"),
            Some(ThinkingConfig {
                thinking_budget: 128,
                include_thoughts: true
            })
        );
        assert_eq!(thinking_config_for("gemini-2.5-flash-image-preview-maxthinking"), None);
        assert_eq!(thinking_config_for("gemini-2.5-flash-image-preview-search-nothinking"), None);
    }
}
