//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use and extended
//! thinking. The system prompt goes in the top-level `system` field; tool
//! results travel as `tool_result` content blocks on user messages, which
//! matches the internal message shape exactly.

use serde_json::Value;

use sy_domain::error::{Error, Result};

use crate::traits::LlmProvider;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, ContentBlock, Role, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8_192;

#[derive(Debug)]
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, timeout_ms: u64) -> Result<Self> {
        Self::with_base_url("https://api.anthropic.com".into(), api_key, timeout_ms)
    }

    pub fn with_base_url(base_url: String, api_key: String, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": match msg.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": content_to_wire(&msg.content),
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });

        if let Some(system) = &req.system {
            body["system"] = Value::String(system.clone());
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !req.tools.is_empty() {
            body["tools"] = serde_json::json!(req
                .tools
                .iter()
                .map(|t| serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                }))
                .collect::<Vec<_>>());
        }
        if let Some(budget) = req.think_level.and_then(|l| l.budget_tokens()) {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": budget,
            });
        }
        body
    }
}

fn content_to_wire(blocks: &[ContentBlock]) -> Value {
    serde_json::json!(blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => {
                serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            ContentBlock::ToolResult { tool_use_id, content, is_error } => serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect::<Vec<_>>())
}

fn parse_content(raw: &Value) -> Vec<ContentBlock> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    for item in items {
        match item["type"].as_str() {
            Some("text") => {
                if let Some(text) = item["text"].as_str() {
                    blocks.push(ContentBlock::Text { text: text.to_owned() });
                }
            }
            Some("tool_use") => {
                blocks.push(ContentBlock::ToolUse {
                    id: item["id"].as_str().unwrap_or_default().to_owned(),
                    name: item["name"].as_str().unwrap_or_default().to_owned(),
                    input: item["input"].clone(),
                });
            }
            // Thinking blocks are not replayed into history.
            _ => {}
        }
    }
    blocks
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&req);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let raw: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            let message = raw["error"]["message"]
                .as_str()
                .unwrap_or("request failed")
                .to_owned();
            return Err(Error::Provider {
                provider: "anthropic".into(),
                message: format!("{status}: {message}"),
            });
        }

        let content = parse_content(&raw["content"]);
        let usage = Usage {
            input_tokens: raw["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: raw["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
            },
            usage,
            model: raw["model"].as_str().unwrap_or(&req.model).to_owned(),
            stop_reason: raw["stop_reason"].as_str().map(str::to_owned),
        })
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_separates_system_and_tools() {
        let provider = AnthropicProvider::new("key".into(), 1000).unwrap();
        let req = ChatRequest {
            model: "claude-sonnet-4-20250514".into(),
            system: Some("be terse".into()),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![sy_domain::tool::ToolDefinition {
                name: "n1__ls".into(),
                description: "list".into(),
                input_schema: json!({"type": "object"}),
            }],
            max_tokens: None,
            temperature: None,
            think_level: None,
        };
        let body = provider.build_body(&req);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["tools"][0]["name"], "n1__ls");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn parses_tool_use_content() {
        let raw = json!([
            {"type": "text", "text": "let me check"},
            {"type": "tool_use", "id": "c1", "name": "n1__ls", "input": {"path": "/"}}
        ]);
        let blocks = parse_content(&raw);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "n1__ls"));
    }
}
