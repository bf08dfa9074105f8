pub mod google;
pub mod native;
pub mod openai;
pub mod to_google;
pub mod to_openai;

pub use google::{GenerateContentRequest, GenerateContentResponse, unwrap_envelope};
pub use native::{NativeRequest, extract_model_from_path, prepare_native_request};
pub use openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
pub use to_google::convert_request;
pub use to_openai::{convert_chunk, convert_response};
