//! Native tools — served by the gateway itself, no node round-trip.

use serde_json::{json, Value};

use sy_domain::channel::{ChannelOutboundMessage, PeerKind, PeerRef};
use sy_domain::tool::ToolDefinition;
use sy_protocol::RpcError;

use crate::state::GatewayState;
use crate::tools::router::CallRoute;

const NATIVE_TOOLS: &[&str] = &[
    "config_get",
    "logs_get",
    "cron",
    "message",
    "sessions_list",
    "session_send",
];

pub fn is_native_tool(name: &str) -> bool {
    NATIVE_TOOLS.contains(&name)
}

pub fn native_tool_defs() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "config_get".into(),
            description: "Read gateway configuration (secrets masked). Optional dotted path.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
            }),
        },
        ToolDefinition {
            name: "logs_get".into(),
            description: "Read recent gateway log lines.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "afterSeq": {"type": "integer"},
                    "limit": {"type": "integer"}
                },
            }),
        },
        ToolDefinition {
            name: "cron".into(),
            description: "Manage scheduled jobs. Actions: add, list, remove, run, runs, status.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["add", "list", "remove", "run", "runs", "status"]},
                    "id": {"type": "string"},
                    "job": {"type": "object"}
                },
                "required": ["action"]
            }),
        },
        ToolDefinition {
            name: "message".into(),
            description: "Send a message out through a channel. Defaults to the last active conversation when no target is given.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "channel": {"type": "string"},
                    "accountId": {"type": "string"},
                    "to": {
                        "type": "object",
                        "properties": {
                            "kind": {"type": "string", "enum": ["dm", "group", "channel", "thread"]},
                            "id": {"type": "string"}
                        },
                        "required": ["kind", "id"]
                    }
                },
                "required": ["text"]
            }),
        },
        ToolDefinition {
            name: "sessions_list".into(),
            description: "List known sessions with activity timestamps.".into(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "session_send".into(),
            description: "Send a message into another session by session key.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sessionKey": {"type": "string"},
                    "message": {"type": "string"}
                },
                "required": ["sessionKey", "message"]
            }),
        },
    ]
}

/// The agent id embedded in `agent:{agentId}:…`.
pub fn agent_id_from_session_key(session_key: &str) -> Option<&str> {
    let mut parts = session_key.split(':');
    match (parts.next(), parts.next()) {
        (Some("agent"), Some(agent_id)) if !agent_id.is_empty() => Some(agent_id),
        _ => None,
    }
}

pub async fn invoke_native(
    state: &GatewayState,
    name: &str,
    args: Value,
    route: &CallRoute,
) -> Result<Value, RpcError> {
    match name {
        "config_get" => {
            let path = args["path"].as_str();
            Ok(json!({"value": state.config.get_masked(path)}))
        }
        "logs_get" => {
            let after = args["afterSeq"].as_u64().unwrap_or(0);
            let limit = args["limit"].as_u64().unwrap_or(100) as usize;
            let lines = state.logs.tail(after, limit.min(500));
            Ok(json!({"lines": lines, "headSeq": state.logs.head_seq()}))
        }
        "cron" => crate::schedule::cron::handle_cron_tool(state, args, route).await,
        "message" => send_message_tool(state, args, route).await,
        "sessions_list" => {
            let mut entries = state.session_index.entries().unwrap_or_default();
            entries.sort_by(|a, b| b.1.last_active_at.cmp(&a.1.last_active_at));
            Ok(json!({"sessions": entries.into_iter().map(|(_, e)| e).collect::<Vec<_>>()}))
        }
        "session_send" => {
            let session_key = args["sessionKey"]
                .as_str()
                .ok_or_else(|| RpcError::validation("sessionKey is required"))?;
            let message = args["message"]
                .as_str()
                .ok_or_else(|| RpcError::validation("message is required"))?;
            let run_id = uuid::Uuid::new_v4().to_string();
            let outcome = state
                .sessions
                .chat_send(
                    state,
                    session_key,
                    message.to_owned(),
                    run_id.clone(),
                    Default::default(),
                    Vec::new(),
                    None,
                )
                .await
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({"status": outcome.status, "runId": run_id}))
        }
        _ => Err(RpcError::not_found(format!("unknown native tool {name}"))),
    }
}

/// Maximum age of `lastActiveContext` before it stops being a valid
/// implicit target for the `message` tool.
const LAST_ACTIVE_MAX_AGE_HOURS: i64 = 24;

async fn send_message_tool(
    state: &GatewayState,
    args: Value,
    route: &CallRoute,
) -> Result<Value, RpcError> {
    let text = args["text"]
        .as_str()
        .ok_or_else(|| RpcError::validation("text is required"))?;

    let explicit_channel = args["channel"].as_str();
    let explicit_peer = if args["to"].is_object() {
        let kind: PeerKind = serde_json::from_value(args["to"]["kind"].clone())
            .map_err(|_| RpcError::validation("invalid to.kind"))?;
        let id = args["to"]["id"]
            .as_str()
            .ok_or_else(|| RpcError::validation("to.id is required"))?;
        Some(PeerRef {
            kind,
            id: id.to_owned(),
            name: None,
            handle: None,
            thread_id: None,
        })
    } else {
        None
    };

    let (channel, account_id, peer) = match (explicit_channel, explicit_peer) {
        (Some(channel), Some(peer)) => {
            let account_id = args["accountId"]
                .as_str()
                .map(str::to_owned)
                .or_else(|| latest_account_for_channel(state, channel))
                .ok_or_else(|| {
                    RpcError::validation(format!("no connected account for channel {channel}"))
                })?;
            (channel.to_owned(), account_id, peer)
        }
        _ => {
            // Fall back to the last active conversation for this agent.
            let agent_id = match route {
                CallRoute::Session { session_key } => agent_id_from_session_key(session_key)
                    .unwrap_or("main")
                    .to_owned(),
                CallRoute::Client { .. } => state.config.typed().default_agent_id(),
            };
            let context = state
                .last_active
                .get(&agent_id)
                .ok()
                .flatten()
                .ok_or_else(|| {
                    RpcError::validation(
                        "no target given and no recent conversation to default to",
                    )
                })?;
            let age = chrono::Utc::now().signed_duration_since(context.timestamp);
            if age.num_hours() >= LAST_ACTIVE_MAX_AGE_HOURS {
                return Err(RpcError::validation(
                    "no target given and the last active conversation is stale; address the message explicitly",
                ));
            }
            (context.channel, context.account_id, context.peer)
        }
    };

    let outbound = ChannelOutboundMessage {
        peer,
        text: text.to_owned(),
        media: Vec::new(),
        reply_to_id: None,
    };
    let message_id = crate::channels::send_outbound(state, &channel, &account_id, outbound)
        .await
        .map_err(|e| RpcError::unavailable(e.to_string()))?;
    Ok(json!({"ok": true, "messageId": message_id}))
}

fn latest_account_for_channel(state: &GatewayState, channel: &str) -> Option<String> {
    state
        .channel_index
        .entries()
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, e)| e.channel == channel)
        .max_by_key(|(_, e)| e.last_message_at.unwrap_or(e.connected_at))
        .map(|(_, e)| e.account_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_names_have_no_namespace_separator() {
        for name in NATIVE_TOOLS {
            assert!(!name.contains("__"), "{name} collides with node namespacing");
            assert!(is_native_tool(name));
        }
        assert!(!is_native_tool("execNode__exec"));
    }

    #[test]
    fn agent_id_parses_from_session_key() {
        assert_eq!(agent_id_from_session_key("agent:main:main"), Some("main"));
        assert_eq!(
            agent_id_from_session_key("agent:ops:whatsapp:acc:dm:+331"),
            Some("ops")
        );
        assert_eq!(agent_id_from_session_key("bogus"), None);
    }
}
