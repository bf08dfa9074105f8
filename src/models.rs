use serde::Serialize;
use serde_json::{Value, json};
use std::sync::LazyLock;

const SEARCH_SUFFIX: &str = "-search";
const NOTHINKING_SUFFIX: &str = "-nothinking";
const MAXTHINKING_SUFFIX: &str = "-maxthinking";

/// Creation timestamp reported for every model in the OpenAI listing.
const OPENAI_CREATED: u64 = 1677610602;

/// Thinking budget meaning "leave it to the caller or the remote default".
pub const DEFAULT_THINKING_BUDGET: i32 = -1;

/// Reasoning policy encoded in a model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Thinking {
    Default,
    NoThinking,
    MaxThinking,
}

/// Set of variant flags. Search and a thinking policy combine freely;
/// `NoThinking` and `MaxThinking` are mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantFlags {
    pub search: bool,
    pub thinking: Thinking,
}

impl VariantFlags {
    pub const BASE: VariantFlags = VariantFlags {
        search: false,
        thinking: Thinking::Default,
    };

    pub const fn new(search: bool, thinking: Thinking) -> Self {
        Self { search, thinking }
    }

    pub fn is_base(&self) -> bool {
        *self == Self::BASE
    }

    /// Every valid flag combination, base first.
    pub fn all() -> [VariantFlags; 6] {
        [
            Self::BASE,
            Self::new(true, Thinking::Default),
            Self::new(false, Thinking::NoThinking),
            Self::new(false, Thinking::MaxThinking),
            Self::new(true, Thinking::NoThinking),
            Self::new(true, Thinking::MaxThinking),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Flash,
    Pro,
    Other,
}

fn family_of(base: &str) -> Family {
    if base.contains("gemini-2.5-flash") {
        Family::Flash
    } else if base.contains("gemini-2.5-pro") {
        Family::Pro
    } else {
        Family::Other
    }
}

/// Image-only models never receive a thinking configuration.
pub fn is_image_model(model: &str) -> bool {
    model.contains("gemini-2.5-flash-image")
}

struct BaseModel {
    name: &'static str,
    display_name: &'static str,
    description: &'static str,
    input_token_limit: u32,
    output_token_limit: u32,
}

const BASE_MODELS: &[BaseModel] = &[
    BaseModel {
        name: "gemini-2.5-pro-preview-03-25",
        display_name: "Gemini 2.5 Pro Preview 03-25",
        description: "Preview version of Gemini 2.5 Pro from March 25th",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-pro-preview-05-06",
        display_name: "Gemini 2.5 Pro Preview 05-06",
        description: "Preview version of Gemini 2.5 Pro from May 6th",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-pro-preview-06-05",
        display_name: "Gemini 2.5 Pro Preview 06-05",
        description: "Preview version of Gemini 2.5 Pro from June 5th",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        description: "Advanced multimodal model with enhanced capabilities",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-flash-preview-05-20",
        display_name: "Gemini 2.5 Flash Preview 05-20",
        description: "Preview version of Gemini 2.5 Flash from May 20th",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-flash-preview-04-17",
        display_name: "Gemini 2.5 Flash Preview 04-17",
        description: "Preview version of Gemini 2.5 Flash from April 17th",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        description: "Fast and efficient multimodal model with latest improvements",
        input_token_limit: 1048576,
        output_token_limit: 65535,
    },
    BaseModel {
        name: "gemini-2.5-flash-image-preview",
        display_name: "Gemini 2.5 Flash Image Preview",
        description: "Gemini 2.5 Flash Image Preview",
        input_token_limit: 32768,
        output_token_limit: 32768,
    },
];

const SUPPORTED_METHODS: &[&str] = &["generateContent", "streamGenerateContent"];

/// One entry of the model catalog: a base model or one of its variants.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(skip)]
    pub base_name: &'static str,
    #[serde(skip)]
    pub flags: VariantFlags,
    #[serde(skip)]
    pub thinking_budget: i32,
    #[serde(skip)]
    pub include_thoughts: bool,
    pub version: &'static str,
    pub display_name: String,
    pub description: String,
    pub input_token_limit: u32,
    pub output_token_limit: u32,
    pub supported_generation_methods: &'static [&'static str],
    pub temperature: f64,
    pub max_temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
}

/// Whether `flags` is offered for `base`.
fn supports_variant(base: &str, flags: VariantFlags) -> bool {
    if flags.is_base() {
        return true;
    }
    match flags.thinking {
        Thinking::Default => !is_image_model(base),
        // The image model still gets the combined search variants.
        Thinking::NoThinking | Thinking::MaxThinking => {
            family_of(base) != Family::Other && (flags.search || !is_image_model(base))
        }
    }
}

fn describe(base: &BaseModel, flags: VariantFlags) -> ModelDescriptor {
    let (display_suffix, description_suffix) = match (flags.search, flags.thinking) {
        (false, Thinking::Default) => ("", ""),
        (true, Thinking::Default) => (
            " with Google Search",
            " (includes Google Search grounding)",
        ),
        (false, Thinking::NoThinking) => (" (No Thinking)", " (thinking disabled)"),
        (false, Thinking::MaxThinking) => (" (Max Thinking)", " (maximum thinking budget)"),
        (true, Thinking::NoThinking) => (
            " with Google Search (No Thinking)",
            " (includes Google Search grounding, thinking disabled)",
        ),
        (true, Thinking::MaxThinking) => (
            " with Google Search (Max Thinking)",
            " (includes Google Search grounding, maximum thinking budget)",
        ),
    };

    ModelDescriptor {
        name: derive_variant_name(base.name, flags),
        base_name: base.name,
        flags,
        thinking_budget: budget_for(base.name, flags.thinking),
        include_thoughts: thoughts_for(base.name, flags.thinking),
        version: "001",
        display_name: format!("{}{}", base.display_name, display_suffix),
        description: format!("{}{}", base.description, description_suffix),
        input_token_limit: base.input_token_limit,
        output_token_limit: base.output_token_limit,
        supported_generation_methods: SUPPORTED_METHODS,
        temperature: 1.0,
        max_temperature: 2.0,
        top_p: 0.95,
        top_k: 64,
    }
}

/// Full catalog, built once: base models first, then search, thinking and
/// combined variants.
static CATALOG: LazyLock<Vec<ModelDescriptor>> = LazyLock::new(|| {
    let groups: [&[VariantFlags]; 4] = [
        &[VariantFlags::BASE],
        &[VariantFlags::new(true, Thinking::Default)],
        &[
            VariantFlags::new(false, Thinking::NoThinking),
            VariantFlags::new(false, Thinking::MaxThinking),
        ],
        &[
            VariantFlags::new(true, Thinking::NoThinking),
            VariantFlags::new(true, Thinking::MaxThinking),
        ],
    ];

    let mut models = Vec::new();
    for group in groups {
        for base in BASE_MODELS {
            for &flags in group {
                if supports_variant(base.name, flags) {
                    models.push(describe(base, flags));
                }
            }
        }
    }
    models
});

pub fn all_models() -> &'static [ModelDescriptor] {
    &CATALOG
}

/// Looks up a catalog entry, tolerating a leading `models/` prefix.
pub fn find_model(name: &str) -> Option<&'static ModelDescriptor> {
    let name = name.strip_prefix("models/").unwrap_or(name);
    CATALOG.iter().find(|m| m.name == name)
}

/// Appends variant suffixes to a base name, search before thinking.
pub fn derive_variant_name(base: &str, flags: VariantFlags) -> String {
    let mut name = String::with_capacity(base.len() + 24);
    name.push_str(base);
    if flags.search {
        name.push_str(SEARCH_SUFFIX);
    }
    match flags.thinking {
        Thinking::Default => {}
        Thinking::NoThinking => name.push_str(NOTHINKING_SUFFIX),
        Thinking::MaxThinking => name.push_str(MAXTHINKING_SUFFIX),
    }
    name
}

/// Splits a model name into its base name and variant flags.
///
/// Suffixes are stripped in the reverse of the order [`derive_variant_name`]
/// appends them, so `parse_variant(derive_variant_name(b, f)) == (b, f)`.
pub fn parse_variant(name: &str) -> (&str, VariantFlags) {
    let mut rest = name.strip_prefix("models/").unwrap_or(name);
    let mut flags = VariantFlags::BASE;

    if let Some(stripped) = rest.strip_suffix(MAXTHINKING_SUFFIX) {
        rest = stripped;
        flags.thinking = Thinking::MaxThinking;
    } else if let Some(stripped) = rest.strip_suffix(NOTHINKING_SUFFIX) {
        rest = stripped;
        flags.thinking = Thinking::NoThinking;
    }
    if let Some(stripped) = rest.strip_suffix(SEARCH_SUFFIX) {
        rest = stripped;
        flags.search = true;
    }

    (rest, flags)
}

pub fn base_name_of(name: &str) -> &str {
    parse_variant(name).0
}

pub fn is_search_model(name: &str) -> bool {
    parse_variant(name).1.search
}

fn budget_for(base: &str, thinking: Thinking) -> i32 {
    match (thinking, family_of(base)) {
        (Thinking::NoThinking, Family::Flash) => 0,
        (Thinking::NoThinking, Family::Pro) => 128,
        (Thinking::MaxThinking, Family::Flash) => 24576,
        (Thinking::MaxThinking, Family::Pro) => 32768,
        _ => DEFAULT_THINKING_BUDGET,
    }
}

fn thoughts_for(base: &str, thinking: Thinking) -> bool {
    !(thinking == Thinking::NoThinking && family_of(base) == Family::Flash)
}

/// Thinking budget for a model name; `-1` when no thinking suffix is present.
pub fn thinking_budget(name: &str) -> i32 {
    let (base, flags) = parse_variant(name);
    budget_for(base, flags.thinking)
}

/// Whether reasoning text should be returned for a model name.
pub fn include_thoughts(name: &str) -> bool {
    let (base, flags) = parse_variant(name);
    thoughts_for(base, flags.thinking)
}

/// OpenAI `GET /v1/models` body.
pub fn openai_model_list() -> Value {
    let data: Vec<Value> = CATALOG
        .iter()
        .map(|m| {
            json!({
                "id": m.name,
                "object": "model",
                "created": OPENAI_CREATED,
                "owned_by": "google",
            })
        })
        .collect();

    json!({ "object": "list", "data": data })
}

/// Native `GET /v1beta/models` body.
pub fn native_model_list() -> Value {
    let models: Vec<Value> = CATALOG
        .iter()
        .map(|m| {
            let mut entry = serde_json::to_value(m).unwrap_or(Value::Null);
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("name".into(), Value::String(format!("models/{}", m.name)));
            }
            entry
        })
        .collect();

    json!({ "models": models })
}
