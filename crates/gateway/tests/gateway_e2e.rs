//! End-to-end scenarios against an in-memory gateway.
//!
//! Peers are simulated with registered mpsc sinks; the LLM is a scripted
//! adapter installed into the provider registry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use sy_domain::channel::{PeerKind, PeerRef};
use sy_domain::config::ModelProvider;
use sy_domain::tool::{Capability, HostRole, NodeRuntime, ToolDefinition};
use sy_gateway::peers::PeerKey;
use sy_gateway::rpc::{dispatch_method, Dispatch};
use sy_gateway::runtime::SessionPatch;
use sy_gateway::state::GatewayState;
use sy_llm::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, Usage};
use sy_protocol::{ChatState, Frame, ProbeResultParams};
use sy_sessions::LastActiveContext;
use sy_store::BlobMeta;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct ScriptedProvider {
    reply: String,
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> sy_domain::Result<ChatResponse> {
        Ok(ChatResponse {
            message: ChatMessage::assistant(self.reply.clone()),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            model: req.model,
            stop_reason: Some("end_turn".into()),
        })
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

fn state_with_reply(reply: &str) -> GatewayState {
    let state = GatewayState::in_memory();
    state.llm.install(
        ModelProvider::Anthropic,
        Arc::new(ScriptedProvider {
            reply: reply.to_owned(),
        }),
    );
    state
}

fn runtime(role: HostRole, caps: &[Capability]) -> NodeRuntime {
    NodeRuntime {
        host_role: role,
        host_capabilities: caps.iter().copied().collect(),
        tool_capabilities: Default::default(),
        host_os: None,
        host_env: None,
        host_bin_status: None,
        host_bin_status_updated_at: None,
    }
}

fn tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: format!("{name} tool"),
        input_schema: json!({"type": "object"}),
    }
}

fn dm_peer(id: &str) -> PeerRef {
    PeerRef {
        kind: PeerKind::Dm,
        id: id.into(),
        name: Some("Tester".into()),
        handle: None,
        thread_id: None,
    }
}

async fn call(
    state: &GatewayState,
    caller: &PeerKey,
    method: &str,
    params: Value,
) -> Result<Value, sy_protocol::RpcError> {
    match dispatch_method(state, caller, "frame-1", method, params).await? {
        Dispatch::Reply(value) => Ok(value),
        Dispatch::Deferred => Ok(json!({"deferred": true})),
    }
}

/// Drain a peer sink until a frame matches, within a deadline.
async fn expect_frame(
    rx: &mut mpsc::Receiver<Frame>,
    mut predicate: impl FnMut(&Frame) -> bool,
) -> Frame {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame = rx.recv().await.expect("peer sink closed");
            if predicate(&frame) {
                return frame;
            }
        }
    })
    .await
    .expect("expected frame did not arrive")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 1. Config round-trip
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn config_round_trip() {
    let state = GatewayState::in_memory();
    let client = PeerKey::client("cli-1");

    call(
        &state,
        &client,
        "config.set",
        json!({"path": "systemPrompt", "value": "test-123"}),
    )
    .await
    .unwrap();

    let got = call(&state, &client, "config.get", json!({"path": "systemPrompt"}))
        .await
        .unwrap();
    assert_eq!(got["value"], "test-123");

    // channels is a plain object that re-serializes losslessly.
    let channels = call(&state, &client, "config.get", json!({"path": "channels"}))
        .await
        .unwrap();
    let text = serde_json::to_string(&channels).unwrap();
    let back: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(channels, back);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 2. Slash /status over chat.send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn slash_status_is_a_command() {
    let state = GatewayState::in_memory();
    let client = PeerKey::client("cli-1");

    let result = call(&state, &client, "chat.send", json!({"message": "/status"}))
        .await
        .unwrap();
    assert_eq!(result["status"], "command");
    assert_eq!(result["command"], "status");
    assert!(result["response"].as_str().unwrap().contains("Session:"));
}

#[tokio::test]
async fn stop_without_run_and_compact_zero() {
    let state = GatewayState::in_memory();
    let client = PeerKey::client("cli-1");

    let result = call(&state, &client, "chat.send", json!({"message": "/stop"}))
        .await
        .unwrap();
    assert_eq!(result["response"], "No run in progress.");

    let err = call(&state, &client, "chat.send", json!({"message": "/compact 0"}))
        .await
        .unwrap_err();
    assert!(err.message.contains("Invalid count"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 3. Shared-tool namespacing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn shared_tool_requires_namespace() {
    let state = GatewayState::in_memory();
    let client = PeerKey::client("cli-1");

    // Two nodes advertising the same bare tool name.
    let (exec_tx, mut exec_rx) = mpsc::channel(8);
    let (other_tx, mut other_rx) = mpsc::channel(8);
    state
        .peers
        .register(PeerKey::node("execNode"), exec_tx, None, None);
    state
        .peers
        .register(PeerKey::node("otherNode"), other_tx, None, None);
    state
        .peers
        .put_node_entry(
            "execNode",
            vec![tool("shared_route_tool")],
            runtime(HostRole::Execution, &[Capability::ShellExec]),
        )
        .unwrap();
    state
        .peers
        .put_node_entry(
            "otherNode",
            vec![tool("shared_route_tool")],
            runtime(HostRole::Specialized, &[]),
        )
        .unwrap();

    // Bare name: rejected before any node sees it.
    let err = call(
        &state,
        &client,
        "tool.invoke",
        json!({"tool": "shared_route_tool", "args": {}}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, sy_protocol::ERR_NOT_FOUND);
    assert!(err.message.contains("No node provides tool"));

    // Namespaced: reaches execNode only.
    let result = call(
        &state,
        &client,
        "tool.invoke",
        json!({"tool": "execNode__shared_route_tool", "args": {"x": 1}}),
    )
    .await
    .unwrap();
    assert_eq!(result["deferred"], true);

    let frame = expect_frame(&mut exec_rx, |f| {
        matches!(f, Frame::Evt { event, .. } if event == "tool.invoke")
    })
    .await;
    let Frame::Evt { payload, .. } = frame else {
        unreachable!()
    };
    assert_eq!(payload["tool"], "shared_route_tool");
    assert_eq!(payload["args"]["x"], 1);
    assert!(other_rx.try_recv().is_err(), "otherNode must not be invoked");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 4. Probe replay with a stable probeId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn probe_replays_with_same_id_after_reconnect() {
    let state = GatewayState::in_memory();

    // A skill that needs the gh binary.
    state
        .blob
        .put(
            "skills/gh-triage/SKILL.md",
            b"---\nname: gh-triage\ndescription: Triage with gh\nrequires:\n  bins: [gh]\n---\nbody\n",
            BlobMeta::of("text/markdown"),
        )
        .unwrap();

    let node_key = PeerKey::node("n1");
    let (tx1, mut rx1) = mpsc::channel(8);
    let generation = state.peers.register(node_key.clone(), tx1, None, None);
    state
        .peers
        .put_node_entry("n1", vec![tool("exec")], runtime(HostRole::Execution, &[Capability::ShellExec]))
        .unwrap();

    state.probes.ensure_probes(&state, "main").await;
    let frame = expect_frame(&mut rx1, |f| {
        matches!(f, Frame::Evt { event, .. } if event == "node.probe")
    })
    .await;
    let Frame::Evt { payload, .. } = frame else {
        unreachable!()
    };
    let probe_id = payload["probeId"].as_str().unwrap().to_owned();
    assert_eq!(payload["kind"], "bins");
    assert_eq!(payload["bins"], json!(["gh"]));

    // Disconnect before answering, then reconnect.
    assert!(state.peers.remove_if_current(&node_key, generation));
    let (tx2, mut rx2) = mpsc::channel(8);
    state.peers.register(node_key.clone(), tx2, None, None);
    state.probes.on_node_connected(&state, "n1").await;

    let frame = expect_frame(&mut rx2, |f| {
        matches!(f, Frame::Evt { event, .. } if event == "node.probe")
    })
    .await;
    let Frame::Evt { payload, .. } = frame else {
        unreachable!()
    };
    assert_eq!(payload["probeId"].as_str().unwrap(), probe_id, "probeId must be stable");

    // Node answers; the bin shows up under the node's hostBins.
    state.probes.on_result(
        &state,
        "n1",
        ProbeResultParams {
            probe_id,
            ok: true,
            bins: [("gh".to_string(), true)].into_iter().collect(),
            error: None,
        },
    );

    let status = call(
        &state,
        &PeerKey::client("cli-1"),
        "skills.status",
        json!({}),
    )
    .await
    .unwrap();
    assert_eq!(status["hostBins"]["n1"]["gh"], true);
    let skills = status["skills"].as_array().unwrap();
    let gh_triage = skills.iter().find(|s| s["name"] == "gh-triage").unwrap();
    assert_eq!(gh_triage["eligible"], true);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 5. Task cron delivery to the last active peer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn task_cron_delivers_to_last_active_context() {
    let state = state_with_reply("TASK_CRON_DELIVERED");
    state.spawn_background();

    // The agent last talked to +33612345678 on testchan.
    state
        .last_active
        .put(
            "main",
            LastActiveContext {
                channel: "testchan".into(),
                account_id: "acc1".into(),
                peer: dm_peer("+33612345678"),
                session_key: "agent:main:testchan:acc1:dm:+33612345678".into(),
                timestamp: chrono::Utc::now(),
            },
        )
        .unwrap();

    // The channel adapter socket.
    let (tx, mut rx) = mpsc::channel(16);
    state
        .peers
        .register(PeerKey::channel("testchan"), tx, Some("acc1".into()), None);

    let job = state
        .cron
        .add(
            &state,
            json!({
                "name": "deliver-test",
                "schedule": {"kind": "at", "atMs": chrono::Utc::now().timestamp_millis() - 1000},
                "spec": {"mode": "task", "message": "reply TASK_CRON_DELIVERED", "deliver": true},
            }),
        )
        .unwrap();
    state.cron.run_job(&state, &job.id, true).await.unwrap();

    let frame = expect_frame(&mut rx, |f| {
        matches!(f, Frame::Evt { event, payload } if event == "channel.send"
            && payload["message"]["text"].as_str().unwrap_or_default().contains("TASK_CRON_DELIVERED"))
    })
    .await;
    let Frame::Evt { payload, .. } = frame else {
        unreachable!()
    };
    assert_eq!(payload["accountId"], "acc1");
    assert_eq!(payload["message"]["peer"]["id"], "+33612345678");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 6. Idle auto-reset preserves the triggering message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn idle_zero_resets_and_keeps_trigger() {
    let state = state_with_reply("done");
    let session_key = "agent:main:main";

    state
        .sessions
        .patch(
            &state,
            session_key,
            SessionPatch {
                reset_policy: Some(
                    serde_json::from_value(json!({"mode": "idle", "idleMinutes": 0})).unwrap(),
                ),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let before = state.sessions.get(&state, session_key).await.unwrap();
    let old_session_id = before["sessionId"].as_str().unwrap().to_owned();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut events = state.chat_tx.subscribe();
    state
        .sessions
        .chat_send(
            &state,
            session_key,
            "trigger".into(),
            "run-1".into(),
            Default::default(),
            Vec::new(),
            None,
        )
        .await
        .unwrap();

    // Wait for the run to finish.
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.state == ChatState::Final {
                return;
            }
        }
    })
    .await
    .unwrap();

    let after = state.sessions.get(&state, session_key).await.unwrap();
    assert_ne!(after["sessionId"].as_str().unwrap(), old_session_id);
    assert!(after["previousSessionIds"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == &json!(old_session_id)));
    assert!(after["messageCount"].as_u64().unwrap() >= 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pairing gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn pairing_holds_first_message_only() {
    let state = state_with_reply("hi");
    state
        .config
        .set("channels.wa.dmPolicy", json!("pairing"))
        .unwrap();

    // The channel socket receives the "awaiting approval" reply.
    let (tx, mut rx) = mpsc::channel(8);
    state
        .peers
        .register(PeerKey::channel("wa"), tx, Some("acc1".into()), None);

    let client = PeerKey::channel("wa");
    let inbound = |message_id: &str, text: &str| {
        json!({
            "channelId": "wa",
            "accountId": "acc1",
            "message": {
                "messageId": message_id,
                "peer": {"kind": "dm", "id": "+33 6 12 34 56 78"},
                "text": text,
            }
        })
    };

    let first = call(&state, &client, "channel.inbound", inbound("m1", "hello"))
        .await
        .unwrap();
    assert_eq!(first["status"], "pending_pairing");
    expect_frame(&mut rx, |f| {
        matches!(f, Frame::Evt { event, payload } if event == "channel.send"
            && payload["message"]["text"].as_str().unwrap_or_default().contains("awaiting approval"))
    })
    .await;

    // Second message: still pending, but no duplicate record and no second
    // hold reply.
    let second = call(&state, &client, "channel.inbound", inbound("m2", "anyone?"))
        .await
        .unwrap();
    assert_eq!(second["status"], "pending_pairing");
    assert_eq!(state.pairing.list().len(), 1);

    // Approve, then the sender goes through to the agent.
    call(
        &state,
        &PeerKey::client("cli-1"),
        "pair.approve",
        json!({"channel": "wa", "senderId": "+33612345678"}),
    )
    .await
    .unwrap();
    let third = call(&state, &client, "channel.inbound", inbound("m3", "now?"))
        .await
        .unwrap();
    assert_eq!(third["status"], "started");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound pipeline details
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn inbound_updates_last_active_and_dedupes() {
    let state = state_with_reply("ack");
    let client = PeerKey::channel("tg");
    let params = json!({
        "channelId": "tg",
        "accountId": "acc1",
        "message": {
            "messageId": "m1",
            "peer": {"kind": "dm", "id": "user9"},
            "text": "hello there",
        }
    });

    let first = call(&state, &client, "channel.inbound", params.clone())
        .await
        .unwrap();
    assert_eq!(first["status"], "started");
    assert_eq!(
        first["sessionKey"].as_str().unwrap(),
        "agent:main:tg:acc1:dm:user9"
    );

    // lastActiveContext updated for the agent.
    let context = state.last_active.get("main").unwrap().unwrap();
    assert_eq!(context.channel, "tg");
    assert_eq!(context.peer.id, "user9");

    // Replay of the same messageId is dropped.
    let replay = call(&state, &client, "channel.inbound", params).await.unwrap();
    assert_eq!(replay["status"], "duplicate");
}

#[tokio::test]
async fn unknown_method_is_404_and_node_connect_requires_runtime() {
    let state = GatewayState::in_memory();
    let err = call(&state, &PeerKey::client("c"), "no.such.method", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code, sy_protocol::ERR_NOT_FOUND);

    let err = sy_gateway::peers::dispatch::validate_connect(
        &state,
        json!({
            "minProtocol": 1,
            "client": {"mode": "node", "id": "n1"},
        }),
    )
    .unwrap_err();
    assert!(err.message.contains("Invalid nodeRuntime"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Async-exec dedup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn exec_terminal_event_is_ingested_once() {
    use sy_protocol::{ExecEventKind, ExecEventParams};

    let state = state_with_reply("noted");
    state.exec.register("n1", "call-1", "agent:main:main");

    let params = ExecEventParams {
        session_id: "call-1".into(),
        event: ExecEventKind::Finished,
        call_id: Some("call-1".into()),
        exit_code: Some(0),
        signal: None,
        output_tail: Some("build ok".into()),
        started_at: None,
        ended_at: None,
        event_id: None,
    };
    state.exec.on_exec_event(&state, "n1", params.clone());
    // Replay of the same terminal event dedups at the queue.
    state.exec.on_exec_event(&state, "n1", params.clone());
    assert_eq!(state.exec.queued_delivery_count(), 1);

    state.exec.retry_due(&state, chrono::Utc::now()).await;
    assert_eq!(state.exec.queued_delivery_count(), 0);

    // A later replay dedups against the delivered set.
    state.exec.on_exec_event(&state, "n1", params);
    assert_eq!(state.exec.queued_delivery_count(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session tool round over the router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider that calls a node tool on the first turn and answers with
/// text once the result comes back.
#[derive(Debug)]
struct ToolCallingProvider;

#[async_trait::async_trait]
impl LlmProvider for ToolCallingProvider {
    async fn chat(&self, req: ChatRequest) -> sy_domain::Result<ChatResponse> {
        let has_tool_result = req.messages.iter().any(|m| {
            m.content
                .iter()
                .any(|b| matches!(b, sy_llm::ContentBlock::ToolResult { .. }))
        });
        let message = if has_tool_result {
            ChatMessage::assistant("tool says READY")
        } else {
            ChatMessage {
                role: sy_llm::Role::Assistant,
                content: vec![sy_llm::ContentBlock::ToolUse {
                    id: "call-7".into(),
                    name: "n1__probe_disk".into(),
                    input: json!({}),
                }],
            }
        };
        Ok(ChatResponse {
            message,
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
            },
            model: req.model,
            stop_reason: None,
        })
    }

    fn provider_id(&self) -> &str {
        "tool-calling"
    }
}

#[tokio::test]
async fn session_tool_fanout_resumes_on_result() {
    let state = GatewayState::in_memory();
    state
        .llm
        .install(ModelProvider::Anthropic, Arc::new(ToolCallingProvider));

    let (tx, mut rx) = mpsc::channel(8);
    state.peers.register(PeerKey::node("n1"), tx, None, None);
    state
        .peers
        .put_node_entry("n1", vec![tool("probe_disk")], runtime(HostRole::Specialized, &[]))
        .unwrap();

    let mut events = state.chat_tx.subscribe();
    state
        .sessions
        .chat_send(
            &state,
            "agent:main:main",
            "check the disk".into(),
            "run-9".into(),
            Default::default(),
            Vec::new(),
            None,
        )
        .await
        .unwrap();

    // The node receives the invoke; answer it like a node would.
    let frame = expect_frame(&mut rx, |f| {
        matches!(f, Frame::Evt { event, .. } if event == "tool.invoke")
    })
    .await;
    let Frame::Evt { payload, .. } = frame else {
        unreachable!()
    };
    assert_eq!(payload["callId"], "call-7");
    state
        .tools
        .on_tool_result(
            &state,
            "n1",
            sy_protocol::ToolResultParams {
                call_id: "call-7".into(),
                result: Some(json!("42% used")),
                error: None,
            },
        )
        .await
        .unwrap();

    // Partial (tool round) then final.
    let final_event = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.state == ChatState::Final {
                return event;
            }
        }
    })
    .await
    .unwrap();
    let text = final_event.message.unwrap()["content"][0]["text"]
        .as_str()
        .unwrap()
        .to_owned();
    assert_eq!(text, "tool says READY");
}
