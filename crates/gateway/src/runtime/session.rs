//! The session actor: mailbox, agent loop, tool fan-out, archival.
//!
//! One task per session key. The mailbox is strict FIFO; a run in flight
//! queues further sends. Tool calls within one assistant turn fan out in
//! parallel and the loop resumes only when all of them are resolved, errored,
//! or timed out. The actor is the sole writer of its persisted state.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use sy_domain::channel::StoredMedia;
use sy_domain::config::{GatewayConfig, ModelProvider};
use sy_domain::error::{Error, Result};
use sy_domain::trace::TraceEvent;
use sy_llm::{resolve_model_alias, ChatMessage, ChatRequest, ThinkLevel};
use sy_protocol::{ChatEventPayload, ChatState};
use sy_sessions::{SessionState, TranscriptArchiver};
use sy_store::PersistedMap;

use crate::state::GatewayState;
use crate::tools::router::{CallRoute, InvokeOutcome};
use crate::tools::native::agent_id_from_session_key;

use super::{
    AbortOutcome, ChannelContext, ChatSendOutcome, CompactOutcome, ResetOutcome, SendOverrides,
    SessionPatch,
};

/// Hard cap on tool rounds within one run.
const MAX_TOOL_LOOPS: usize = 25;

/// Messages returned by `preview`.
const PREVIEW_MESSAGES: usize = 10;

/// Per-file cap when injecting workspace documents into the system prompt.
const WORKSPACE_FILE_MAX_CHARS: usize = 20_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mailbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub enum SnapshotKind {
    Get,
    Stats,
    Preview,
    History,
}

pub enum SessionMsg {
    ChatSend {
        text: String,
        run_id: String,
        overrides: SendOverrides,
        media: Vec<StoredMedia>,
        context: Option<ChannelContext>,
        reply: oneshot::Sender<ChatSendOutcome>,
    },
    ToolResult {
        call_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Reset {
        reply: oneshot::Sender<Result<ResetOutcome>>,
    },
    Compact {
        keep: usize,
        reply: oneshot::Sender<Result<CompactOutcome>>,
    },
    Abort {
        reply: oneshot::Sender<AbortOutcome>,
    },
    Patch {
        patch: SessionPatch,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        kind: SnapshotKind,
        reply: oneshot::Sender<Value>,
    },
}

struct QueuedSend {
    text: String,
    run_id: String,
    overrides: SendOverrides,
    media: Vec<StoredMedia>,
    #[allow(dead_code)]
    context: Option<ChannelContext>,
}

struct PendingTool {
    call_id: String,
    resolved: Option<(String, bool)>,
}

enum LlmWait {
    Response(Result<sy_llm::ChatResponse>),
    Aborted,
    Closed,
}

enum ToolWait {
    Completed,
    Aborted,
    Closed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionActor {
    state: GatewayState,
    session_key: String,
    agent_id: String,
    rx: mpsc::UnboundedReceiver<SessionMsg>,
    busy: Arc<AtomicBool>,
    store: PersistedMap<SessionState>,
    session: SessionState,
    queue: VecDeque<QueuedSend>,
    seen_run_ids: HashSet<String>,
    archiver: TranscriptArchiver,
}

impl SessionActor {
    pub fn new(
        state: GatewayState,
        session_key: String,
        rx: mpsc::UnboundedReceiver<SessionMsg>,
        busy: Arc<AtomicBool>,
    ) -> Self {
        let store: PersistedMap<SessionState> = PersistedMap::new(state.kv.clone(), "session");
        let session = match store.get(&session_key) {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                let fresh = SessionState::new(Utc::now());
                if let Err(e) = store.put(&session_key, fresh.clone()) {
                    tracing::warn!(error = %e, session_key = %session_key, "failed to persist new session");
                }
                TraceEvent::SessionResolved {
                    session_key: session_key.clone(),
                    session_id: fresh.session_id.clone(),
                    is_new: true,
                }
                .emit();
                fresh
            }
            Err(e) => {
                tracing::error!(error = %e, session_key = %session_key, "corrupt session state, starting fresh");
                SessionState::new(Utc::now())
            }
        };
        let agent_id = agent_id_from_session_key(&session_key)
            .unwrap_or("main")
            .to_owned();
        let archiver = TranscriptArchiver::new(state.blob.clone());
        Self {
            state,
            session_key,
            agent_id,
            rx,
            busy,
            store,
            session,
            queue: VecDeque::new(),
            seen_run_ids: HashSet::new(),
            archiver,
        }
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                SessionMsg::ChatSend {
                    text,
                    run_id,
                    overrides,
                    media,
                    context,
                    reply,
                } => {
                    if !self.seen_run_ids.insert(run_id.clone()) {
                        // Idempotent ingestion: a replayed run id is not
                        // enqueued twice.
                        let _ = reply.send(ChatSendOutcome {
                            status: "queued",
                            run_id,
                        });
                        continue;
                    }
                    let _ = reply.send(ChatSendOutcome {
                        status: "started",
                        run_id: run_id.clone(),
                    });
                    let mut current = QueuedSend {
                        text,
                        run_id,
                        overrides,
                        media,
                        context,
                    };
                    loop {
                        self.busy.store(true, Ordering::Relaxed);
                        self.execute_run(current).await;
                        self.busy.store(false, Ordering::Relaxed);
                        match self.queue.pop_front() {
                            Some(next) => current = next,
                            None => break,
                        }
                    }
                    if self.seen_run_ids.len() > 512 {
                        self.seen_run_ids.clear();
                    }
                }
                SessionMsg::ToolResult { call_id, .. } => {
                    tracing::warn!(
                        session_key = %self.session_key,
                        call_id = %call_id,
                        "tool result with no active run ignored"
                    );
                }
                SessionMsg::Reset { reply } => {
                    let _ = reply.send(self.do_reset("manual"));
                }
                SessionMsg::Compact { keep, reply } => {
                    let _ = reply.send(self.do_compact(keep));
                }
                SessionMsg::Abort { reply } => {
                    let _ = reply.send(AbortOutcome {
                        was_running: false,
                        run_id: None,
                        pending_tools_cancelled: 0,
                    });
                }
                SessionMsg::Patch { patch, reply } => {
                    let _ = reply.send(self.apply_patch(patch));
                }
                SessionMsg::Snapshot { kind, reply } => {
                    let _ = reply.send(self.snapshot(kind));
                }
            }
        }
    }

    // ── One run ────────────────────────────────────────────────────

    async fn execute_run(&mut self, send: QueuedSend) {
        let run_id = send.run_id.clone();
        let config = self.state.config.typed();
        let now = Utc::now();

        // Reset policy first, so the triggering message lands in the new
        // session.
        let tz = resolve_tz(config.user_timezone.as_deref());
        if let Some(reason) =
            self.session
                .should_auto_reset(&config.session.default_reset_policy, now, tz)
        {
            if let Err(e) = self.do_reset(&reason.to_string()) {
                tracing::warn!(error = %e, session_key = %self.session_key, "auto-reset failed");
            }
        }

        let user_text = compose_user_text(&send.text, &send.media);
        let mut user_message = json!({
            "role": "user",
            "content": [{"type": "text", "text": user_text}],
        });
        if !send.media.is_empty() {
            user_message["media"] = json!(send.media);
        }
        self.session.messages.push(user_message);
        self.session.updated_at = now;
        self.persist();

        // Snapshots taken once per run.
        let tools_snapshot = self.state.tools.exposed_tools(&self.state);
        let system_prompt = self.build_system_prompt(&config);

        for _round in 0..MAX_TOOL_LOOPS {
            let (provider_kind, model_id) = self.select_model(&config, &send.overrides);
            let provider = match self.state.llm.resolve(provider_kind, &config.api_keys) {
                Ok(provider) => provider,
                Err(e) => {
                    self.emit(&run_id, ChatState::Error, None, Some(e.to_string()));
                    return;
                }
            };

            let request = ChatRequest {
                model: model_id,
                system: Some(system_prompt.clone()),
                messages: self.messages_for_llm(),
                tools: tools_snapshot.clone(),
                max_tokens: None,
                temperature: None,
                think_level: self.select_think_level(&send.overrides),
            };

            let response = match self
                .await_llm(provider, request, config.timeouts.llm_ms, &run_id)
                .await
            {
                LlmWait::Response(Ok(response)) => response,
                LlmWait::Response(Err(e)) => {
                    self.state
                        .logs
                        .push(format!("llm error run={run_id}: {e}"));
                    self.emit(&run_id, ChatState::Error, None, Some(e.to_string()));
                    return;
                }
                LlmWait::Aborted => {
                    self.emit(&run_id, ChatState::Error, None, Some("aborted".into()));
                    return;
                }
                LlmWait::Closed => return,
            };

            // Empty content is an upstream error, never saved.
            if response.message.content.is_empty() {
                self.emit(
                    &run_id,
                    ChatState::Error,
                    None,
                    Some("model returned empty content".into()),
                );
                return;
            }

            self.session
                .record_usage(response.usage.input_tokens, response.usage.output_tokens);
            let assistant_value =
                serde_json::to_value(&response.message).unwrap_or(Value::Null);
            self.session.messages.push(assistant_value.clone());
            self.session.updated_at = Utc::now();
            self.persist();

            let tool_uses: Vec<(String, String, Value)> = response
                .message
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_owned(), name.to_owned(), input.clone()))
                .collect();

            if tool_uses.is_empty() {
                self.emit(&run_id, ChatState::Final, Some(assistant_value), None);
                return;
            }

            // Tool round: partial event, parallel fan-out, single resume.
            self.emit(&run_id, ChatState::Partial, Some(assistant_value), None);
            let mut pending = self.dispatch_tools(tool_uses).await;
            if pending.iter().any(|p| p.resolved.is_none()) {
                let deadline =
                    Instant::now() + std::time::Duration::from_millis(config.timeouts.tool_ms);
                match self.wait_for_tools(&mut pending, deadline, &run_id).await {
                    ToolWait::Completed => {}
                    ToolWait::Aborted => {
                        self.emit(&run_id, ChatState::Error, None, Some("aborted".into()));
                        return;
                    }
                    ToolWait::Closed => return,
                }
            }

            let result_blocks: Vec<Value> = pending
                .iter()
                .map(|p| {
                    let (content, is_error) = p
                        .resolved
                        .clone()
                        .unwrap_or_else(|| ("tool call unresolved".into(), true));
                    json!({
                        "type": "tool_result",
                        "tool_use_id": p.call_id,
                        "content": content,
                        "is_error": is_error,
                    })
                })
                .collect();
            self.session
                .messages
                .push(json!({"role": "user", "content": result_blocks}));
            self.session.updated_at = Utc::now();
            self.persist();
        }

        self.emit(
            &run_id,
            ChatState::Error,
            None,
            Some(format!("tool loop limit reached ({MAX_TOOL_LOOPS} rounds)")),
        );
    }

    async fn dispatch_tools(
        &mut self,
        tool_uses: Vec<(String, String, Value)>,
    ) -> Vec<PendingTool> {
        let mut pending = Vec::with_capacity(tool_uses.len());
        for (call_id, name, input) in tool_uses {
            let outcome = self
                .state
                .tools
                .invoke(
                    &self.state,
                    &name,
                    input,
                    CallRoute::Session {
                        session_key: self.session_key.clone(),
                    },
                    Some(call_id.clone()),
                )
                .await;
            let resolved = match outcome {
                Ok(InvokeOutcome::Immediate(value)) => Some((value.to_string(), false)),
                Ok(InvokeOutcome::Dispatched { .. }) => None,
                Err(rpc) => Some((rpc.message, true)),
            };
            pending.push(PendingTool { call_id, resolved });
        }
        pending
    }

    async fn await_llm(
        &mut self,
        provider: Arc<dyn sy_llm::LlmProvider>,
        request: ChatRequest,
        llm_ms: u64,
        run_id: &str,
    ) -> LlmWait {
        let deadline = Instant::now() + std::time::Duration::from_millis(llm_ms);
        let fut = provider.chat(request);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                response = &mut fut => return LlmWait::Response(response),
                _ = tokio::time::sleep_until(deadline) => {
                    self.state.logs.push(format!(
                        "llm call timed out after {llm_ms}ms session={}",
                        self.session_key
                    ));
                    return LlmWait::Response(Err(Error::Timeout(format!(
                        "LLM call exceeded {llm_ms}ms"
                    ))));
                }
                maybe = self.rx.recv() => match maybe {
                    None => return LlmWait::Closed,
                    Some(msg) => {
                        if let Some(reply) = self.on_side_msg(msg) {
                            let _ = reply.send(AbortOutcome {
                                was_running: true,
                                run_id: Some(run_id.to_owned()),
                                pending_tools_cancelled: 0,
                            });
                            return LlmWait::Aborted;
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_tools(
        &mut self,
        pending: &mut Vec<PendingTool>,
        deadline: Instant,
        run_id: &str,
    ) -> ToolWait {
        loop {
            if pending.iter().all(|p| p.resolved.is_some()) {
                return ToolWait::Completed;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let mut timed_out = 0;
                    for tool in pending.iter_mut().filter(|p| p.resolved.is_none()) {
                        self.state.tools.cancel_call(&tool.call_id);
                        tool.resolved = Some(("tool call timed out".into(), true));
                        timed_out += 1;
                    }
                    self.state.logs.push(format!(
                        "tool timeout run={run_id} session={} calls={timed_out}",
                        self.session_key
                    ));
                    return ToolWait::Completed;
                }
                maybe = self.rx.recv() => match maybe {
                    None => return ToolWait::Closed,
                    Some(SessionMsg::ToolResult { call_id, result, error }) => {
                        match pending.iter_mut().find(|p| p.call_id == call_id && p.resolved.is_none()) {
                            Some(tool) => {
                                tool.resolved = Some(match error {
                                    Some(error) => (error, true),
                                    None => (
                                        result
                                            .map(|v| tool_result_text(&v))
                                            .unwrap_or_default(),
                                        false,
                                    ),
                                });
                            }
                            None => {
                                tracing::warn!(call_id = %call_id, "tool result for unknown call ignored");
                            }
                        }
                    }
                    Some(msg) => {
                        if let Some(reply) = self.on_side_msg(msg) {
                            let mut cancelled = 0;
                            for tool in pending.iter().filter(|p| p.resolved.is_none()) {
                                self.state.tools.cancel_call(&tool.call_id);
                                cancelled += 1;
                            }
                            let _ = reply.send(AbortOutcome {
                                was_running: true,
                                run_id: Some(run_id.to_owned()),
                                pending_tools_cancelled: cancelled,
                            });
                            return ToolWait::Aborted;
                        }
                    }
                }
            }
        }
    }

    /// Handle every mailbox message that can arrive mid-run except tool
    /// results. Returns the reply sender when the message was an abort; the
    /// caller finishes the cancellation.
    fn on_side_msg(&mut self, msg: SessionMsg) -> Option<oneshot::Sender<AbortOutcome>> {
        match msg {
            SessionMsg::ChatSend {
                text,
                run_id,
                overrides,
                media,
                context,
                reply,
            } => {
                if self.seen_run_ids.insert(run_id.clone()) {
                    self.queue.push_back(QueuedSend {
                        text,
                        run_id: run_id.clone(),
                        overrides,
                        media,
                        context,
                    });
                }
                let _ = reply.send(ChatSendOutcome {
                    status: "queued",
                    run_id,
                });
                None
            }
            SessionMsg::ToolResult { call_id, .. } => {
                tracing::warn!(call_id = %call_id, "tool result outside a tool wait ignored");
                None
            }
            SessionMsg::Abort { reply } => Some(reply),
            SessionMsg::Patch { patch, reply } => {
                let _ = reply.send(self.apply_patch(patch));
                None
            }
            SessionMsg::Snapshot { kind, reply } => {
                let _ = reply.send(self.snapshot(kind));
                None
            }
            SessionMsg::Reset { reply } => {
                let _ = reply.send(Err(Error::Validation("run in progress".into())));
                None
            }
            SessionMsg::Compact { reply, .. } => {
                let _ = reply.send(Err(Error::Validation("run in progress".into())));
                None
            }
        }
    }

    // ── State operations ───────────────────────────────────────────

    fn do_reset(&mut self, reason: &str) -> Result<ResetOutcome> {
        let old_session_id = self.session.session_id.clone();
        if !self.session.messages.is_empty() {
            self.archiver.archive(
                &self.agent_id,
                &self.session_key,
                &old_session_id,
                &self.session.messages,
                self.session.input_tokens,
                self.session.output_tokens,
            )?;
        }
        let now = Utc::now();
        self.session.reset(now);
        self.persist();
        TraceEvent::SessionReset {
            session_key: self.session_key.clone(),
            old_session_id: old_session_id.clone(),
            new_session_id: self.session.session_id.clone(),
            reason: reason.to_owned(),
        }
        .emit();
        Ok(ResetOutcome {
            old_session_id,
            new_session_id: self.session.session_id.clone(),
        })
    }

    fn do_compact(&mut self, keep: usize) -> Result<CompactOutcome> {
        if keep == 0 {
            return Err(Error::Validation("Invalid count".into()));
        }
        let total = self.session.messages.len();
        if total <= keep {
            return Ok(CompactOutcome {
                archived: 0,
                kept: total,
            });
        }
        let archived = total - keep;
        let head: Vec<Value> = self.session.messages[..archived].to_vec();
        let part = self.session.archived_parts + 1;
        self.archiver.archive_part(
            &self.agent_id,
            &self.session_key,
            &self.session.session_id,
            part,
            &head,
        )?;
        self.session.messages.drain(..archived);
        self.session.archived_parts = part;
        self.session.updated_at = Utc::now();
        self.persist();
        Ok(CompactOutcome { archived, kept: keep })
    }

    fn apply_patch(&mut self, patch: SessionPatch) -> Result<()> {
        if let Some(settings) = patch.settings {
            let Value::Object(entries) = settings else {
                return Err(Error::Validation("settings must be an object".into()));
            };
            for (key, value) in entries {
                if value.is_null() {
                    self.session.settings.remove(&key);
                } else {
                    self.session.settings.insert(key, value);
                }
            }
        }
        if let Some(label) = patch.label {
            self.session.label = Some(label);
        }
        if let Some(reset_policy) = patch.reset_policy {
            self.session.reset_policy = Some(reset_policy);
        }
        self.session.updated_at = Utc::now();
        self.persist();
        Ok(())
    }

    fn snapshot(&self, kind: SnapshotKind) -> Value {
        match kind {
            SnapshotKind::Get => json!({
                "sessionKey": self.session_key,
                "sessionId": self.session.session_id,
                "messageCount": self.session.messages.len(),
                "inputTokens": self.session.input_tokens,
                "outputTokens": self.session.output_tokens,
                "settings": self.session.settings,
                "resetPolicy": self.session.reset_policy,
                "previousSessionIds": self.session.previous_session_ids,
                "label": self.session.label,
                "createdAt": self.session.created_at,
                "updatedAt": self.session.updated_at,
            }),
            SnapshotKind::Stats => json!({
                "sessionId": self.session.session_id,
                "messageCount": self.session.messages.len(),
                "inputTokens": self.session.input_tokens,
                "outputTokens": self.session.output_tokens,
                "totalTokens": self.session.input_tokens + self.session.output_tokens,
            }),
            SnapshotKind::Preview => {
                let start = self.session.messages.len().saturating_sub(PREVIEW_MESSAGES);
                json!({
                    "sessionId": self.session.session_id,
                    "messages": self.session.messages[start..].to_vec(),
                })
            }
            SnapshotKind::History => json!({
                "sessionId": self.session.session_id,
                "messages": self.session.messages,
            }),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.put(&self.session_key, self.session.clone()) {
            tracing::error!(error = %e, session_key = %self.session_key, "persisting session failed");
        }
    }

    // ── Context building ───────────────────────────────────────────

    fn messages_for_llm(&self) -> Vec<ChatMessage> {
        self.session
            .messages
            .iter()
            .filter_map(|value| serde_json::from_value::<ChatMessage>(value.clone()).ok())
            .collect()
    }

    fn build_system_prompt(&self, config: &GatewayConfig) -> String {
        let mut parts = Vec::new();
        if let Some(prompt) = self.state.config.get(Some("systemPrompt")).as_str() {
            parts.push(prompt.to_owned());
        }
        for file in ["SOUL.md", "USER.md", "AGENTS.md", "TOOLS.md", "MEMORY.md"] {
            let key = format!("agents/{}/{file}", self.agent_id);
            if let Ok(Some((bytes, _))) = self.state.blob.get(&key) {
                let mut text = String::from_utf8_lossy(&bytes).into_owned();
                if text.len() > WORKSPACE_FILE_MAX_CHARS {
                    text.truncate(WORKSPACE_FILE_MAX_CHARS);
                }
                if !text.trim().is_empty() {
                    parts.push(format!("## {file}\n{text}"));
                }
            }
        }

        let host_bins = crate::schedule::probes::host_bins_by_node(&self.state);
        if let Ok(skills) = self
            .state
            .skills
            .enumerate(&self.agent_id, &config.skills, &host_bins)
        {
            let lines: Vec<String> = skills
                .iter()
                .filter(|s| s.eligible)
                .map(|s| format!("- {}: {}", s.name, s.description))
                .collect();
            if !lines.is_empty() {
                parts.push(format!("## Skills\n{}", lines.join("\n")));
            }
        }
        parts.join("\n\n")
    }

    fn select_model(
        &self,
        config: &GatewayConfig,
        overrides: &SendOverrides,
    ) -> (ModelProvider, String) {
        let requested = overrides
            .model
            .clone()
            .or_else(|| {
                self.session
                    .settings
                    .get("model")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            });
        match requested {
            Some(name) => match resolve_model_alias(&name) {
                Some((provider, id)) => (provider, id.to_owned()),
                None => (config.model.provider, name),
            },
            None => (config.model.provider, config.model.id.clone()),
        }
    }

    fn select_think_level(&self, overrides: &SendOverrides) -> Option<ThinkLevel> {
        overrides.think_level.or_else(|| {
            self.session
                .settings
                .get("thinkLevel")
                .and_then(|v| v.as_str())
                .and_then(ThinkLevel::parse)
        })
    }

    fn emit(&self, run_id: &str, state: ChatState, message: Option<Value>, error: Option<String>) {
        let payload = ChatEventPayload {
            run_id: Some(run_id.to_owned()),
            session_key: self.session_key.clone(),
            state,
            message,
            error,
        };
        let _ = self.state.chat_tx.send(payload);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn resolve_tz(user_timezone: Option<&str>) -> chrono_tz::Tz {
    user_timezone
        .and_then(|tz| tz.parse::<chrono_tz::Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}

fn compose_user_text(text: &str, media: &[StoredMedia]) -> String {
    let mut out = text.to_owned();
    for item in media {
        match &item.transcription {
            Some(transcription) => {
                out.push_str(&format!("\n[audio transcription: {transcription}]"));
            }
            None => {
                out.push_str(&format!(
                    "\n[attachment: {} {} ({})]",
                    match item.kind {
                        sy_domain::channel::MediaKind::Image => "image",
                        sy_domain::channel::MediaKind::Audio => "audio",
                        sy_domain::channel::MediaKind::Video => "video",
                        sy_domain::channel::MediaKind::Document => "document",
                    },
                    item.blob_key,
                    item.mime_type
                ));
            }
        }
    }
    out
}

/// Flatten a tool result value for the transcript: strings stay bare,
/// anything else is compact JSON.
fn tool_result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_domain::channel::MediaKind;

    #[test]
    fn user_text_carries_transcriptions_and_attachments() {
        let media = vec![
            StoredMedia {
                blob_key: "media/k/a.ogg".into(),
                mime_type: "audio/ogg".into(),
                kind: MediaKind::Audio,
                filename: None,
                size: Some(10),
                duration: Some(2.0),
                transcription: Some("hello there".into()),
            },
            StoredMedia {
                blob_key: "media/k/b.jpg".into(),
                mime_type: "image/jpeg".into(),
                kind: MediaKind::Image,
                filename: None,
                size: Some(20),
                duration: None,
                transcription: None,
            },
        ];
        let text = compose_user_text("look at this", &media);
        assert!(text.starts_with("look at this"));
        assert!(text.contains("[audio transcription: hello there]"));
        assert!(text.contains("[attachment: image media/k/b.jpg (image/jpeg)]"));
    }

    #[test]
    fn tool_result_text_flattens() {
        assert_eq!(tool_result_text(&json!("plain")), "plain");
        assert_eq!(tool_result_text(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn tz_resolution_falls_back_to_utc() {
        assert_eq!(resolve_tz(Some("Europe/Paris")).name(), "Europe/Paris");
        assert_eq!(resolve_tz(Some("Not/AZone")).name(), "UTC");
        assert_eq!(resolve_tz(None).name(), "UTC");
    }
}
