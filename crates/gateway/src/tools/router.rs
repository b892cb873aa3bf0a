//! Tool router.
//!
//! Exposed tools are the native set plus `{nodeId}__{toolName}` for every
//! tool a connected node advertises. The namespace is mandatory: a bare tool
//! name never reaches a node. Every dispatched call holds exactly one route
//! entry (session or client) until its result, timeout, or cancellation.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use sy_domain::tool::{namespaced_tool, split_namespaced_tool};
use sy_domain::trace::TraceEvent;
use sy_protocol::{Frame, RpcError, ToolInvokePayload, ToolResultParams, EVT_TOOL_INVOKE};

use crate::peers::PeerKey;
use crate::state::GatewayState;

/// Who is waiting on a dispatched call.
#[derive(Debug, Clone)]
pub enum CallRoute {
    Session {
        session_key: String,
    },
    Client {
        client_id: String,
        frame_id: String,
        created_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct PendingCall {
    tool: String,
    node_id: String,
    route: CallRoute,
}

/// Result of an invoke: native tools answer inline, node tools defer.
pub enum InvokeOutcome {
    Immediate(Value),
    Dispatched { call_id: String },
}

pub struct ToolRouter {
    pending: Mutex<HashMap<String, PendingCall>>,
    /// Client-routed calls dropped by a client disconnect; a late node
    /// answer for one of these gets a 503-style error instead of a 404.
    dropped_client_calls: Mutex<HashMap<String, DateTime<Utc>>>,
    max_pending_per_node: usize,
    max_pending_global: usize,
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRouter {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            dropped_client_calls: Mutex::new(HashMap::new()),
            max_pending_per_node: 50,
            max_pending_global: 200,
        }
    }

    /// The full tool surface: native tools plus namespaced node tools from
    /// every *connected* node.
    pub fn exposed_tools(&self, state: &GatewayState) -> Vec<sy_domain::tool::ToolDefinition> {
        let mut tools = crate::tools::native::native_tool_defs();
        for key in state.peers.connected_keys(sy_protocol::PeerMode::Node) {
            let Some(entry) = state.peers.node_entry(&key.id) else {
                continue;
            };
            for tool in entry.tools {
                tools.push(sy_domain::tool::ToolDefinition {
                    name: namespaced_tool(&key.id, &tool.name),
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }
        tools
    }

    /// Invoke a tool by wire name. Native tools execute inline; node tools
    /// dispatch a `tool.invoke` event and register the pending route.
    pub async fn invoke(
        &self,
        state: &GatewayState,
        wire_name: &str,
        args: Value,
        route: CallRoute,
        call_id: Option<String>,
    ) -> Result<InvokeOutcome, RpcError> {
        if crate::tools::native::is_native_tool(wire_name) {
            // Session-routed native calls resolve through the mailbox like
            // node tools: the actor is mid-dispatch and must not be awaited
            // inline (a tool targeting its own session would deadlock).
            if let CallRoute::Session { session_key } = &route {
                let call_id = call_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let state = state.clone();
                let name = wire_name.to_owned();
                let session_key = session_key.clone();
                let route = route.clone();
                let spawned_call_id = call_id.clone();
                tokio::spawn(async move {
                    let (result, error) =
                        match crate::tools::native::invoke_native(&state, &name, args, &route)
                            .await
                        {
                            Ok(value) => (Some(value), None),
                            Err(rpc) => (None, Some(rpc.message)),
                        };
                    state
                        .sessions
                        .deliver_tool_result(&state, &session_key, &spawned_call_id, result, error)
                        .await;
                });
                return Ok(InvokeOutcome::Dispatched { call_id });
            }
            let value = crate::tools::native::invoke_native(state, wire_name, args, &route).await?;
            return Ok(InvokeOutcome::Immediate(value));
        }

        let Some((node_id, tool)) = split_namespaced_tool(wire_name) else {
            return Err(RpcError::not_found(format!(
                "No node provides tool {wire_name}"
            )));
        };
        if !state.peers.node_advertises(node_id, tool) {
            return Err(RpcError::not_found(format!(
                "No node provides tool {wire_name}"
            )));
        }

        // Bounded pendings keep one wedged node from wedging the router.
        {
            let pending = self.pending.lock();
            if pending.len() >= self.max_pending_global {
                return Err(RpcError::unavailable(format!(
                    "global pending limit reached ({} calls in flight)",
                    pending.len()
                )));
            }
            let node_count = pending.values().filter(|c| c.node_id == node_id).count();
            if node_count >= self.max_pending_per_node {
                return Err(RpcError::unavailable(format!(
                    "pending limit reached for node {node_id} ({node_count} calls in flight)"
                )));
            }
        }

        let call_id = call_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.pending.lock().insert(
            call_id.clone(),
            PendingCall {
                tool: wire_name.to_owned(),
                node_id: node_id.to_owned(),
                route: route.clone(),
            },
        );

        // Long-running shell execs are also tracked for out-of-band
        // completion events.
        if tool == "exec" {
            if let CallRoute::Session { session_key } = &route {
                state.exec.register(node_id, &call_id, session_key);
            }
        }

        let payload = ToolInvokePayload {
            call_id: call_id.clone(),
            tool: tool.to_owned(),
            args,
        };
        let frame = Frame::evt(
            EVT_TOOL_INVOKE,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
        );
        let sink = state.peers.sink(&PeerKey::node(node_id));
        let sent = match sink {
            Some(sink) => sink.send(frame).await.is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().remove(&call_id);
            return Err(RpcError::unavailable(format!("node {node_id} not connected")));
        }

        TraceEvent::ToolRouted {
            call_id: call_id.clone(),
            tool: wire_name.to_owned(),
            node_id: node_id.to_owned(),
        }
        .emit();
        Ok(InvokeOutcome::Dispatched { call_id })
    }

    /// Handle a `tool.result` from a node. Matches by call id and delivers
    /// to the registered route.
    pub async fn on_tool_result(
        &self,
        state: &GatewayState,
        node_id: &str,
        params: ToolResultParams,
    ) -> Result<(), RpcError> {
        let pending = self.pending.lock().remove(&params.call_id);
        let Some(pending) = pending else {
            if self
                .dropped_client_calls
                .lock()
                .remove(&params.call_id)
                .is_some()
            {
                return Err(RpcError::unavailable(
                    "originating client disconnected before the result arrived",
                ));
            }
            state
                .logs
                .push(format!("tool.result for unknown callId {} dropped", params.call_id));
            tracing::warn!(call_id = %params.call_id, node_id, "tool.result for unknown call");
            return Ok(());
        };

        if pending.node_id != node_id {
            tracing::warn!(
                call_id = %params.call_id,
                expected = %pending.node_id,
                got = node_id,
                "tool.result from unexpected node"
            );
        }

        match pending.route {
            CallRoute::Session { session_key } => {
                state
                    .sessions
                    .deliver_tool_result(state, &session_key, &params.call_id, params.result, params.error)
                    .await;
            }
            CallRoute::Client { client_id, frame_id, .. } => {
                let frame = match params.error {
                    Some(error) => Frame::err(frame_id, RpcError::internal(error)),
                    None => Frame::ok(
                        frame_id,
                        serde_json::json!({"result": params.result.unwrap_or(Value::Null)}),
                    ),
                };
                state.peers.send(&PeerKey::client(client_id), frame);
            }
        }
        Ok(())
    }

    /// Fail all in-flight calls dispatched to a node (node disconnect).
    pub async fn fail_pending_for_node(&self, state: &GatewayState, node_id: &str) -> usize {
        let drained: Vec<(String, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, c)| c.node_id == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|c| (id, c)))
                .collect()
        };

        let count = drained.len();
        for (call_id, call) in drained {
            let error = format!("node {node_id} disconnected during {}", call.tool);
            match call.route {
                CallRoute::Session { session_key } => {
                    state
                        .sessions
                        .deliver_tool_result(state, &session_key, &call_id, None, Some(error))
                        .await;
                }
                CallRoute::Client { client_id, frame_id, .. } => {
                    state.peers.send(
                        &PeerKey::client(client_id),
                        Frame::err(frame_id, RpcError::unavailable(error)),
                    );
                }
            }
        }
        if count > 0 {
            state
                .logs
                .push(format!("failed {count} in-flight calls for disconnected node {node_id}"));
        }
        count
    }

    /// Drop client-routed pendings for a disconnected client.
    pub fn drop_client_pendings(&self, client_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let mut dropped = self.dropped_client_calls.lock();
        let before = pending.len();
        let now = Utc::now();
        pending.retain(|call_id, call| match &call.route {
            CallRoute::Client { client_id: owner, .. } if owner == client_id => {
                dropped.insert(call_id.clone(), now);
                false
            }
            _ => true,
        });
        // Keep the tombstone set bounded.
        if dropped.len() > 1_000 {
            let cutoff = now - Duration::hours(1);
            dropped.retain(|_, at| *at > cutoff);
        }
        before - pending.len()
    }

    /// Remove a single pending call (session abort / timeout). Returns true
    /// when the call was still pending.
    pub fn cancel_call(&self, call_id: &str) -> bool {
        self.pending.lock().remove(call_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
