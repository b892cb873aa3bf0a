//! RPC method handlers, table-driven.
//!
//! Each method returns a payload (wrapped into a `res` frame by the socket
//! loop) or [`Dispatch::Deferred`] for long-polling calls that answer later
//! (`logs.get` with `wait`, client `tool.invoke`). Unknown methods are 404.

use serde_json::{json, Value};

use sy_protocol::{
    ChannelInboundParams, ExecEventParams, PeerMode, ProbeResultParams, RpcError, ToolResultParams,
};

use crate::peers::PeerKey;
use crate::runtime::commands::{execute_command, parse_command};
use crate::runtime::SessionPatch;
use crate::schedule::cron::rpc_from_domain;
use crate::state::GatewayState;
use crate::tools::router::{CallRoute, InvokeOutcome};

pub enum Dispatch {
    Reply(Value),
    Deferred,
}

pub async fn dispatch_method(
    state: &GatewayState,
    caller: &PeerKey,
    frame_id: &str,
    method: &str,
    params: Value,
) -> Result<Dispatch, RpcError> {
    match method {
        // ── Config ─────────────────────────────────────────────────
        "config.get" => {
            let path = params["path"].as_str();
            Ok(Dispatch::Reply(json!({"value": state.config.get_masked(path)})))
        }
        "config.set" => {
            let path = params["path"]
                .as_str()
                .ok_or_else(|| RpcError::validation("path is required"))?;
            state
                .config
                .set(path, params["value"].clone())
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({"ok": true})))
        }

        // ── Pairing ────────────────────────────────────────────────
        "pair.list" => Ok(Dispatch::Reply(json!({"pairings": state.pairing.list()}))),
        "pair.approve" => {
            let (channel, sender_id) = pairing_params(&params)?;
            let record = state
                .pairing
                .take(channel, sender_id)
                .map_err(rpc_from_domain)?
                .ok_or_else(|| RpcError::not_found("no pairing request for that sender"))?;
            // Approval lands on the channel allowlist.
            let path = format!("channels.{channel}.allowFrom");
            let mut allow_from: Vec<String> = state
                .config
                .get(Some(path.as_str()))
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            if !allow_from.contains(&record.sender_id) {
                allow_from.push(record.sender_id.clone());
            }
            state
                .config
                .set(&path, json!(allow_from))
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({"ok": true, "senderId": record.sender_id})))
        }
        "pair.deny" => {
            let (channel, sender_id) = pairing_params(&params)?;
            let removed = state
                .pairing
                .take(channel, sender_id)
                .map_err(rpc_from_domain)?
                .is_some();
            Ok(Dispatch::Reply(json!({"ok": true, "removed": removed})))
        }

        // ── Sessions ───────────────────────────────────────────────
        "session.get" => {
            let session_key = session_key_param(&params)?;
            let view = state
                .sessions
                .get(state, session_key)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(view))
        }
        "session.stats" => {
            let session_key = session_key_param(&params)?;
            let view = state
                .sessions
                .stats(state, session_key)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(view))
        }
        "session.preview" => {
            let session_key = session_key_param(&params)?;
            let view = state
                .sessions
                .preview(state, session_key)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(view))
        }
        "session.history" => {
            let session_key = session_key_param(&params)?;
            let view = state
                .sessions
                .history(state, session_key)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(view))
        }
        "session.patch" => {
            let session_key = session_key_param(&params)?;
            let patch: SessionPatch = serde_json::from_value(params.clone())
                .map_err(|e| RpcError::validation(format!("invalid patch: {e}")))?;
            state
                .sessions
                .patch(state, session_key, patch)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({"ok": true})))
        }
        "session.reset" => {
            let session_key = session_key_param(&params)?;
            let outcome = state
                .sessions
                .reset(state, session_key)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({
                "ok": true,
                "oldSessionId": outcome.old_session_id,
                "newSessionId": outcome.new_session_id,
            })))
        }
        "sessions.list" => {
            let mut entries = state.session_index.entries().unwrap_or_default();
            entries.sort_by(|a, b| b.1.last_active_at.cmp(&a.1.last_active_at));
            Ok(Dispatch::Reply(json!({
                "sessions": entries.into_iter().map(|(_, e)| e).collect::<Vec<_>>(),
            })))
        }

        // ── Chat ───────────────────────────────────────────────────
        "chat.send" => handle_chat_send(state, params).await,
        "channel.inbound" => {
            let inbound: ChannelInboundParams = serde_json::from_value(params)
                .map_err(|e| RpcError::validation(format!("invalid inbound: {e}")))?;
            let result = crate::channels::inbound::handle_channel_inbound(state, inbound)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(result))
        }

        // ── Tools ──────────────────────────────────────────────────
        "tool.invoke" => {
            let tool = params["tool"]
                .as_str()
                .ok_or_else(|| RpcError::validation("tool is required"))?;
            let args = params["args"].clone();
            let route = CallRoute::Client {
                client_id: caller.id.clone(),
                frame_id: frame_id.to_owned(),
                created_at: chrono::Utc::now(),
            };
            match state.tools.invoke(state, tool, args, route, None).await? {
                InvokeOutcome::Immediate(value) => {
                    Ok(Dispatch::Reply(json!({"result": value})))
                }
                InvokeOutcome::Dispatched { .. } => Ok(Dispatch::Deferred),
            }
        }
        "tool.result" => {
            require_mode(caller, PeerMode::Node)?;
            let result: ToolResultParams = serde_json::from_value(params)
                .map_err(|e| RpcError::validation(format!("invalid tool result: {e}")))?;
            state.tools.on_tool_result(state, &caller.id, result).await?;
            Ok(Dispatch::Reply(json!({"ok": true})))
        }
        "node.probe.result" => {
            require_mode(caller, PeerMode::Node)?;
            let result: ProbeResultParams = serde_json::from_value(params)
                .map_err(|e| RpcError::validation(format!("invalid probe result: {e}")))?;
            state.probes.on_result(state, &caller.id, result);
            Ok(Dispatch::Reply(json!({"ok": true})))
        }
        "node.exec.event" => {
            require_mode(caller, PeerMode::Node)?;
            let event: ExecEventParams = serde_json::from_value(params)
                .map_err(|e| RpcError::validation(format!("invalid exec event: {e}")))?;
            state.exec.on_exec_event(state, &caller.id, event);
            Ok(Dispatch::Reply(json!({"ok": true})))
        }

        // ── Logs ───────────────────────────────────────────────────
        "logs.get" => {
            let after = params["afterSeq"].as_u64().unwrap_or(0);
            let limit = params["limit"].as_u64().unwrap_or(100).min(500) as usize;
            let wait = params["wait"].as_bool().unwrap_or(false);
            let lines = state.logs.tail(after, limit);
            if !lines.is_empty() || !wait {
                return Ok(Dispatch::Reply(json!({
                    "lines": lines,
                    "headSeq": state.logs.head_seq(),
                })));
            }
            // Long-poll: answer from a background task once a line lands.
            let state = state.clone();
            let caller = caller.clone();
            let frame_id = frame_id.to_owned();
            tokio::spawn(async move {
                let lines = state.logs.wait_tail(after, limit).await;
                let payload = json!({"lines": lines, "headSeq": state.logs.head_seq()});
                state
                    .peers
                    .send(&caller, sy_protocol::Frame::ok(frame_id, payload));
            });
            Ok(Dispatch::Deferred)
        }
        "logs.result" => {
            require_mode(caller, PeerMode::Node)?;
            if let Some(lines) = params["lines"].as_array() {
                for line in lines {
                    if let Some(text) = line.as_str() {
                        state.logs.push(format!("[{}] {text}", caller.id));
                    }
                }
            }
            Ok(Dispatch::Reply(json!({"ok": true})))
        }

        // ── Heartbeat ──────────────────────────────────────────────
        "heartbeat.status" => Ok(Dispatch::Reply(state.heartbeats.status(state))),
        "heartbeat.trigger" => {
            let agent_id = params["agentId"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| state.config.typed().default_agent_id());
            let result = state
                .heartbeats
                .run_for_agent(state, &agent_id, true)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(result))
        }

        // ── Cron ───────────────────────────────────────────────────
        "cron.status" => Ok(Dispatch::Reply(json!({
            "enabled": state.config.typed().cron.enabled,
            "jobs": state.cron.list().len(),
            "nextRunAtMs": state.cron.next_fire().map(|t| t.timestamp_millis()),
        }))),
        "cron.list" => Ok(Dispatch::Reply(json!({"jobs": state.cron.list()}))),
        "cron.add" => {
            let job = state.cron.add(state, params).map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({"job": job})))
        }
        "cron.update" => {
            let id = id_param(&params)?;
            let job = state
                .cron
                .update(state, id, params.clone())
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({"job": job})))
        }
        "cron.remove" => {
            let id = id_param(&params)?;
            let removed = state.cron.remove(state, id).map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({"removed": removed})))
        }
        "cron.run" => {
            let id = id_param(&params)?;
            let force = params["mode"].as_str() == Some("force");
            let result = state
                .cron
                .run_job(state, id, force)
                .await
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(result))
        }
        "cron.runs" => {
            let id = id_param(&params)?;
            Ok(Dispatch::Reply(json!({"runs": state.cron.runs(id)})))
        }

        // ── Skills ─────────────────────────────────────────────────
        "skills.status" => {
            let agent_id = params["agentId"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| state.config.typed().default_agent_id());
            let config = state.config.typed();
            let host_bins = crate::schedule::probes::host_bins_by_node(state);
            let skills = state
                .skills
                .enumerate(&agent_id, &config.skills, &host_bins)
                .map_err(rpc_from_domain)?;
            Ok(Dispatch::Reply(json!({
                "agentId": agent_id,
                "skills": skills,
                "hostBins": host_bins,
                "executionNode": state.peers.execution_node_id(),
                "pendingProbes": state.probes.list().len(),
            })))
        }
        "skills.refresh" => {
            state.skills.invalidate();
            let agent_id = params["agentId"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| state.config.typed().default_agent_id());
            state.probes.ensure_probes(state, &agent_id).await;
            Ok(Dispatch::Reply(json!({"ok": true})))
        }

        other => Err(RpcError::not_found(format!("unknown method {other}"))),
    }
}

async fn handle_chat_send(
    state: &GatewayState,
    params: Value,
) -> Result<Dispatch, RpcError> {
    let message = params["message"]
        .as_str()
        .ok_or_else(|| RpcError::validation("message is required"))?;
    let config = state.config.typed();
    let session_key = params["sessionKey"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| {
            sy_sessions::main_session_key(&config.default_agent_id(), &config.session.main_key)
        });

    // Slash commands are handled by the gateway, not the model.
    if let Some((command, args)) = parse_command(message) {
        let outcome = execute_command(state, &state.sessions, &session_key, command, &args)
            .await
            .map_err(rpc_from_domain)?;
        return Ok(Dispatch::Reply(json!({
            "status": "command",
            "command": outcome.command,
            "response": outcome.response,
        })));
    }

    let directives = crate::runtime::directives::parse_directives(message);
    if directives.directive_only {
        let mut settings = serde_json::Map::new();
        if let Some(model) = &directives.model {
            settings.insert("model".into(), json!(model));
        }
        if let Some(level) = directives.think_level {
            settings.insert("thinkLevel".into(), json!(level));
        }
        state
            .sessions
            .patch(
                state,
                &session_key,
                SessionPatch {
                    settings: Some(Value::Object(settings)),
                    ..Default::default()
                },
            )
            .await
            .map_err(rpc_from_domain)?;
        return Ok(Dispatch::Reply(json!({"status": "directive"})));
    }
    let text = if directives.cleaned.is_empty() {
        message.to_owned()
    } else {
        directives.cleaned.clone()
    };
    let run_id = params["runId"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let overrides = crate::runtime::SendOverrides {
        model: directives.model,
        think_level: directives.think_level,
    };
    let outcome = state
        .sessions
        .chat_send(state, &session_key, text, run_id.clone(), overrides, Vec::new(), None)
        .await
        .map_err(rpc_from_domain)?;
    Ok(Dispatch::Reply(json!({
        "status": outcome.status,
        "runId": run_id,
        "sessionKey": session_key,
    })))
}

fn session_key_param(params: &Value) -> Result<&str, RpcError> {
    params["sessionKey"]
        .as_str()
        .ok_or_else(|| RpcError::validation("sessionKey is required"))
}

fn id_param(params: &Value) -> Result<&str, RpcError> {
    params["id"]
        .as_str()
        .ok_or_else(|| RpcError::validation("id is required"))
}

fn pairing_params(params: &Value) -> Result<(&str, &str), RpcError> {
    let channel = params["channel"]
        .as_str()
        .ok_or_else(|| RpcError::validation("channel is required"))?;
    let sender_id = params["senderId"]
        .as_str()
        .ok_or_else(|| RpcError::validation("senderId is required"))?;
    Ok((channel, sender_id))
}

fn require_mode(caller: &PeerKey, mode: PeerMode) -> Result<(), RpcError> {
    if caller.mode != mode {
        return Err(RpcError::validation(format!(
            "method restricted to {mode} peers"
        )));
    }
    Ok(())
}
