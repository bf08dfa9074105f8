//! Native Gemini request handling: the caller already speaks the remote
//! dialect, so the body is passed through with gateway policy applied on top.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::format::to_google::{default_safety_settings, google_search_tool};
use crate::models::{
    DEFAULT_THINKING_BUDGET, include_thoughts, is_image_model, is_search_model, thinking_budget,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Model name from a native route such as
/// `/v1beta/models/gemini-2.5-pro:generateContent`.
pub fn extract_model_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/');
    segments.by_ref().find(|s| *s == "models")?;
    let segment = segments.next()?;
    let model = segment.split_once(':').map_or(segment, |(model, _)| model);
    (!model.is_empty()).then_some(model)
}

/// Applies safety, thinking and search policy for `model` to a native body.
pub fn prepare_native_request(mut request: NativeRequest, model: &str) -> NativeRequest {
    if request.safety_settings.as_ref().is_none_or(Value::is_null) {
        request.safety_settings = Some(json!(default_safety_settings()));
    }

    if !is_image_model(model) {
        apply_thinking(&mut request, model);
    }

    if is_search_model(model) {
        let tools = request.tools.get_or_insert_with(Vec::new);
        let has_search = tools.iter().any(|t| t.get("googleSearch").is_some());
        if !has_search {
            tools.push(google_search_tool());
        }
    }

    request
}

fn apply_thinking(request: &mut NativeRequest, model: &str) {
    let generation_config = request.generation_config.get_or_insert_with(Map::new);
    let thinking = generation_config
        .entry("thinkingConfig")
        .or_insert_with(|| Value::Object(Map::new()));
    if !thinking.is_object() {
        *thinking = Value::Object(Map::new());
    }
    let Value::Object(thinking) = thinking else {
        return;
    };

    thinking.insert("includeThoughts".to_string(), json!(include_thoughts(model)));

    // A caller-chosen budget survives unless the model name pins one.
    let budget = thinking_budget(model);
    if budget != DEFAULT_THINKING_BUDGET || !thinking.contains_key("thinkingBudget") {
        thinking.insert("thinkingBudget".to_string(), json!(budget));
    }
}
