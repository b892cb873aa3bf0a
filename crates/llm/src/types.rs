//! Provider-agnostic chat types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sy_domain::tool::ToolDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content block inside a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Always carried in a user-role message, answering a prior `ToolUse`.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// Requested reasoning depth, set per message by the `/think:` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkLevel {
    None,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "none" => Some(Self::None),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    /// Thinking token budget for providers that take one.
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Minimal => Some(1_024),
            Self::Low => Some(4_096),
            Self::Medium => Some(8_192),
            Self::High => Some(16_384),
            Self::Xhigh => Some(32_768),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub think_level: Option<ThinkLevel>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The assistant message, blocks included.
    pub message: ChatMessage,
    pub usage: Usage,
    pub model: String,
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blocks_roundtrip() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "using a tool".into() },
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "node1__read_file".into(),
                    input: json!({"path": "/tmp/x"}),
                },
            ],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"][1]["type"], "tool_use");
        let back: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert!(back.has_tool_use());
        assert_eq!(back.tool_uses().len(), 1);
        assert_eq!(back.text(), "using a tool");
    }

    #[test]
    fn think_level_parses() {
        assert_eq!(ThinkLevel::parse("HIGH"), Some(ThinkLevel::High));
        assert_eq!(ThinkLevel::parse("xhigh"), Some(ThinkLevel::Xhigh));
        assert_eq!(ThinkLevel::parse("ultra"), None);
        assert!(ThinkLevel::None.budget_tokens().is_none());
    }
}
