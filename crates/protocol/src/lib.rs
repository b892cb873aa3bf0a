//! Wire protocol: framed JSON over WebSocket.
//!
//! Three frame shapes, serde-tagged on `type`:
//! - `req`  — expects exactly one `res` with the same `id`
//! - `res`  — only in response to a prior `req`
//! - `evt`  — fire-and-forget
//!
//! Peers (clients, nodes, channel adapters) speak this protocol to the
//! gateway. `connect` is the only method permitted before a socket is marked
//! connected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sy_domain::tool::{NodeRuntime, ToolDefinition};

/// Minimum protocol version this gateway speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are dropped without parsing.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    Evt {
        event: String,
        payload: Value,
    },
}

impl Frame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: RpcError) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    pub fn evt(event: impl Into<String>, payload: Value) -> Self {
        Frame::Evt {
            event: event.into(),
            payload,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Not-connected: a non-`connect` request arrived before `connect`.
pub const ERR_NOT_CONNECTED: i64 = 101;
/// Bad params (invalid nodeRuntime, bad path, bad cron expression, …).
pub const ERR_VALIDATION: i64 = 400;
/// Unknown method, node, tool, or call id.
pub const ERR_NOT_FOUND: i64 = 404;
/// Internal failure; handler exceptions map here by default.
pub const ERR_INTERNAL: i64 = 500;
/// Target temporarily unavailable (originating client gone, node busy).
pub const ERR_UNAVAILABLE: i64 = 503;

/// WebSocket close code used when a desynced peer is evicted.
pub const CLOSE_DESYNC: u16 = 4000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ERR_NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            retryable: Some(true),
            ..Self::new(ERR_UNAVAILABLE, message)
        }
    }

    pub fn not_connected() -> Self {
        Self::new(ERR_NOT_CONNECTED, "not connected: call connect first")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    Client,
    Node,
    Channel,
}

impl std::fmt::Display for PeerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMode::Client => write!(f, "client"),
            PeerMode::Node => write!(f, "node"),
            PeerMode::Channel => write!(f, "channel"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub mode: PeerMode,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Channel peers: the account within the adapter; the channel key is
    /// `{id}:{accountId}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Nodes: advertised tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Nodes: runtime descriptor. Required for `mode=node`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_runtime: Option<NodeRuntime>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event & method payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const EVT_TOOL_INVOKE: &str = "tool.invoke";
pub const EVT_NODE_PROBE: &str = "node.probe";
pub const EVT_CHAT: &str = "chat";
pub const EVT_CHANNEL_SEND: &str = "channel.send";
pub const EVT_CHANNEL_TYPING: &str = "channel.typing";

/// Gateway → node: invoke one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvokePayload {
    pub call_id: String,
    pub tool: String,
    pub args: Value,
}

/// Node → gateway (`tool.result` method params).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultParams {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Gateway → node: binary-availability probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbePayload {
    pub probe_id: String,
    pub kind: String,
    pub bins: Vec<String>,
    pub timeout_ms: u64,
}

/// Node → gateway (`node.probe.result` method params).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResultParams {
    pub probe_id: String,
    pub ok: bool,
    #[serde(default)]
    pub bins: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecEventKind {
    Started,
    Finished,
    Failed,
    TimedOut,
}

impl ExecEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecEventKind::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecEventKind::Started => "started",
            ExecEventKind::Finished => "finished",
            ExecEventKind::Failed => "failed",
            ExecEventKind::TimedOut => "timed_out",
        }
    }
}

/// Node → gateway (`node.exec.event` method params): lifecycle of a
/// long-running shell execution that outlived its original tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecEventParams {
    pub session_id: String,
    pub event: ExecEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Explicit dedup id; derived from the event tuple when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Partial,
    Final,
    Error,
}

/// Gateway → clients/channels (`chat` event payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub session_key: String,
    pub state: ChatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `channel.inbound` method params, and the queue's `inbound` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInboundParams {
    pub channel_id: String,
    pub account_id: String,
    pub message: sy_domain::channel::ChannelInboundMessage,
}

/// The queue's `status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatusParams {
    pub channel_id: String,
    pub account_id: String,
    pub status: sy_domain::channel::ChannelAccountStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shapes_roundtrip() {
        let req = Frame::Req {
            id: "1".into(),
            method: "connect".into(),
            params: Some(serde_json::json!({"minProtocol": 1})),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "req");
        let back: Frame = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Frame::Req { ref method, .. } if method == "connect"));

        let res = Frame::ok("1", serde_json::json!({"ready": true}));
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"type\":\"res\""));
        assert!(json.contains("\"ok\":true"));

        let evt = Frame::evt(EVT_CHAT, serde_json::json!({"state": "final"}));
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "evt");
        assert_eq!(json["event"], "chat");
    }

    #[test]
    fn malformed_frame_is_an_error_not_a_panic() {
        assert!(serde_json::from_str::<Frame>("{\"type\":\"bogus\"}").is_err());
        assert!(serde_json::from_str::<Frame>("not json at all").is_err());
    }

    #[test]
    fn error_frame_carries_code() {
        let frame = Frame::err("9", RpcError::not_found("no node provides tool"));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], 404);
    }

    #[test]
    fn connect_params_node_runtime_optional_in_shape() {
        let params: ConnectParams = serde_json::from_value(serde_json::json!({
            "minProtocol": 1,
            "client": {"mode": "client", "id": "cli-1"}
        }))
        .unwrap();
        assert_eq!(params.client.mode, PeerMode::Client);
        assert!(params.node_runtime.is_none());
    }

    #[test]
    fn exec_event_kinds() {
        assert!(!ExecEventKind::Started.is_terminal());
        assert!(ExecEventKind::TimedOut.is_terminal());
        let kind: ExecEventKind = serde_json::from_str("\"timed_out\"").unwrap();
        assert_eq!(kind, ExecEventKind::TimedOut);
    }
}
