use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    pub safety_settings: Vec<SafetySetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text(TextPart),
    InlineData(InlineDataPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(TextPart { text: text.into() })
    }

    pub fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::InlineData(InlineDataPart {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineDataPart {
    pub inline_data: InlineData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: i32,
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<ResponseContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseContent {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

/// Response parts are read field-wise so unfamiliar part kinds
/// (function calls, executable code) are skipped rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub thoughts_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

/// Strips the Code Assist `{"response": {...}}` envelope when present.
pub fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("response").is_some_and(Value::is_object) => {
            map.remove("response").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_serialization() {
        assert_eq!(serde_json::to_value(Part::text("hi")).unwrap(), json!({"text": "hi"}));
        assert_eq!(
            serde_json::to_value(Part::inline("image/png", "QQ==")).unwrap(),
            json!({"inlineData": {"mimeType": "image/png", "data": "QQ=="}})
        );
    }

    #[test]
    fn test_generation_config_omits_absent_fields() {
        let config = GenerationConfig {
            max_output_tokens: Some(10),
            thinking_config: Some(ThinkingConfig {
                thinking_budget: 0,
                include_thoughts: false,
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(config).unwrap(),
            json!({
                "maxOutputTokens": 10,
                "thinkingConfig": {"thinkingBudget": 0, "includeThoughts": false}
            })
        );
    }

    #[test]
    fn test_response_tolerates_unknown_parts() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking", "thought": true},
                    {"functionCall": {"name": "f", "args": {}}},
                    {"text": "answer"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 5, "totalTokenCount": 8},
            "modelVersion": "gemini-2.5-pro"
        }))
        .unwrap();

        let parts = &response.candidates[0].content.as_ref().unwrap().parts;
        assert_eq!(parts.len(), 3);
        assert!(parts[0].thought);
        assert!(parts[1].text.is_none());
        assert_eq!(response.usage_metadata.unwrap().total_token_count, 8);
    }

    #[test]
    fn test_unwrap_envelope() {
        let wrapped = json!({"response": {"candidates": []}, "traceId": "t"});
        assert_eq!(unwrap_envelope(wrapped), json!({"candidates": []}));

        let bare = json!({"candidates": []});
        assert_eq!(unwrap_envelope(bare.clone()), bare);

        let odd = json!({"response": "text"});
        assert_eq!(unwrap_envelope(odd.clone()), odd);
    }
}
