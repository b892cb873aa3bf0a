use sy_domain::error::Result;

use crate::types::{ChatRequest, ChatResponse};

/// Trait every LLM adapter implements.
///
/// Adapters translate between the internal block-structured types and each
/// provider's HTTP wire format. The session loop only ever sees whole
/// messages; partial chat events are emitted per assistant turn, so no
/// token-level streaming is required here.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
