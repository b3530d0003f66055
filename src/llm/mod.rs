pub mod client;
pub mod models;
pub mod parse;
pub mod prompts;

pub use client::{ChatMessage, LlmClient, LlmRequest, LlmResponse, OpenRouterClient};
pub use models::{Model, Usage};
pub use parse::{parse_file_blocks, parse_json_object, parse_structured_content, FileBlock};
