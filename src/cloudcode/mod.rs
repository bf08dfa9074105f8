pub mod client;
pub mod discover;
pub mod request;
pub mod sse;

pub use client::CloudCodeClient;
pub use request::CloudCodeRequest;
pub use sse::{Relay, RelayMode};
