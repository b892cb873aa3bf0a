//! OpenAI-compatible adapter.
//!
//! Covers OpenAI, OpenRouter, and Google's OpenAI-compat endpoint. Internal
//! block-structured messages map to the chat-completions shape: tool_use
//! blocks become `tool_calls`, tool_result blocks split into one
//! `role:"tool"` message each.

use serde_json::Value;

use sy_domain::error::{Error, Result};

use crate::traits::LlmProvider;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, ContentBlock, Role, Usage};

#[derive(Debug)]
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: &str, base_url: &str, api_key: String, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            id: id.to_owned(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in &req.messages {
            append_wire_messages(&mut messages, msg);
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
        });
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !req.tools.is_empty() {
            body["tools"] = serde_json::json!(req
                .tools
                .iter()
                .map(|t| serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                }))
                .collect::<Vec<_>>());
        }
        body
    }
}

fn append_wire_messages(out: &mut Vec<Value>, msg: &ChatMessage) {
    match msg.role {
        Role::Assistant => {
            let text = msg.text();
            let tool_calls: Vec<Value> = msg
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| {
                    serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": input.to_string(),
                        }
                    })
                })
                .collect();
            let mut wire = serde_json::json!({"role": "assistant", "content": text});
            if !tool_calls.is_empty() {
                wire["tool_calls"] = serde_json::json!(tool_calls);
            }
            out.push(wire);
        }
        Role::User => {
            let mut text_parts = Vec::new();
            for block in &msg.content {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolResult { tool_use_id, content, .. } => {
                        out.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text_parts.is_empty() {
                out.push(serde_json::json!({
                    "role": "user",
                    "content": text_parts.join("\n"),
                }));
            }
        }
    }
}

fn parse_message(raw: &Value) -> ChatMessage {
    let mut content = Vec::new();
    if let Some(text) = raw["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.to_owned() });
        }
    }
    if let Some(calls) = raw["tool_calls"].as_array() {
        for call in calls {
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            let input: Value =
                serde_json::from_str(arguments).unwrap_or(Value::Object(Default::default()));
            content.push(ContentBlock::ToolUse {
                id: call["id"].as_str().unwrap_or_default().to_owned(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_owned(),
                input,
            });
        }
    }
    ChatMessage {
        role: Role::Assistant,
        content,
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
                provider: self.id.clone(),
                message: format!("{status}: {message}"),
            });
        }

        let choice = &raw["choices"][0];
        Ok(ChatResponse {
            message: parse_message(&choice["message"]),
            usage: Usage {
                input_tokens: raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: raw["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            },
            model: raw["model"].as_str().unwrap_or(&req.model).to_owned(),
            stop_reason: choice["finish_reason"].as_str().map(str::to_owned),
        })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_results_split_into_tool_messages() {
        let provider =
            OpenAiCompatProvider::new("openai", "https://api.openai.com/v1", "k".into(), 1000)
                .unwrap();
        let req = ChatRequest {
            model: "gpt-4o".into(),
            system: Some("sys".into()),
            messages: vec![
                ChatMessage::user("run it"),
                ChatMessage {
                    role: Role::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: "c1".into(),
                        name: "n1__run".into(),
                        input: json!({}),
                    }],
                },
                ChatMessage {
                    role: Role::User,
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: "c1".into(),
                        content: "done".into(),
                        is_error: false,
                    }],
                },
            ],
            ..Default::default()
        };
        let body = provider.build_body(&req);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "n1__run");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
    }

    #[test]
    fn parses_tool_calls_from_response() {
        let msg = parse_message(&json!({
            "content": null,
            "tool_calls": [{
                "id": "c9",
                "type": "function",
                "function": {"name": "n1__ls", "arguments": "{\"path\": \"/\"}"}
            }]
        }));
        assert!(msg.has_tool_use());
        let uses = msg.tool_uses();
        assert_eq!(uses[0].1, "n1__ls");
        assert_eq!(uses[0].2["path"], "/");
    }
}
