//! LLM bindings consumed by the session agent loop.
//!
//! The gateway talks to one trait, [`LlmProvider::chat`]; adapters translate
//! to each provider's HTTP wire format. Messages are block-structured
//! (text / tool_use / tool_result) so tool fan-out round-trips losslessly.

pub mod anthropic;
pub mod openai_compat;
pub mod registry;
pub mod traits;
pub mod types;

pub use registry::{resolve_model_alias, ProviderRegistry};
pub use traits::LlmProvider;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, Role, ThinkLevel, Usage,
};
