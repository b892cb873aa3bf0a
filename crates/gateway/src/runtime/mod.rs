//! Per-conversation session actors.
//!
//! Each session is an independent actor: a tokio task owning a strict FIFO
//! mailbox and its own persisted state. At most one run is active per
//! session; additional sends queue and drain in arrival order. The gateway
//! talks to actors only through [`SessionManager`].

pub mod commands;
pub mod directives;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use sy_domain::channel::PeerRef;
use sy_domain::config::ResetPolicy;
use sy_domain::error::{Error, Result};
use sy_llm::ThinkLevel;

use crate::state::GatewayState;
use session::{SessionActor, SessionMsg, SnapshotKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public op types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-message overrides carried by directives or callers.
#[derive(Debug, Clone, Default)]
pub struct SendOverrides {
    pub model: Option<String>,
    pub think_level: Option<ThinkLevel>,
}

/// Channel context attached to an inbound dispatch (delivery awareness).
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub channel: String,
    pub account_id: String,
    pub peer: PeerRef,
}

#[derive(Debug, Clone)]
pub struct ChatSendOutcome {
    /// `"started"` or `"queued"`.
    pub status: &'static str,
    pub run_id: String,
}

#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub old_session_id: String,
    pub new_session_id: String,
}

#[derive(Debug, Clone)]
pub struct CompactOutcome {
    pub archived: usize,
    pub kept: usize,
}

#[derive(Debug, Clone)]
pub struct AbortOutcome {
    pub was_running: bool,
    pub run_id: Option<String>,
    pub pending_tools_cancelled: usize,
}

/// `session.patch` body: shallow-merged settings, label, reset policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    pub settings: Option<Value>,
    pub label: Option<String>,
    pub reset_policy: Option<ResetPolicy>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMsg>,
    busy: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct SessionManager {
    actors: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn-or-fetch the actor for a session key.
    fn ensure(&self, state: &GatewayState, session_key: &str) -> SessionHandle {
        if let Some(handle) = self.actors.read().get(session_key) {
            return handle.clone();
        }
        let mut actors = self.actors.write();
        if let Some(handle) = actors.get(session_key) {
            return handle.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle {
            tx,
            busy: busy.clone(),
        };
        actors.insert(session_key.to_owned(), handle.clone());
        let actor = SessionActor::new(state.clone(), session_key.to_owned(), rx, busy);
        tokio::spawn(actor.run());
        handle
    }

    fn existing(&self, session_key: &str) -> Option<SessionHandle> {
        self.actors.read().get(session_key).cloned()
    }

    /// Is the session currently inside a run? (Heartbeats skip busy targets.)
    pub fn is_processing(&self, session_key: &str) -> bool {
        self.existing(session_key)
            .map(|h| h.busy.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Known session keys with live actors.
    pub fn active_keys(&self) -> Vec<String> {
        self.actors.read().keys().cloned().collect()
    }

    pub async fn chat_send(
        &self,
        state: &GatewayState,
        session_key: &str,
        text: String,
        run_id: String,
        overrides: SendOverrides,
        media: Vec<sy_domain::channel::StoredMedia>,
        context: Option<ChannelContext>,
    ) -> Result<ChatSendOutcome> {
        let handle = self.ensure(state, session_key);
        let (reply, on_reply) = oneshot::channel();
        handle
            .tx
            .send(SessionMsg::ChatSend {
                text,
                run_id,
                overrides,
                media,
                context,
                reply,
            })
            .map_err(|_| Error::Other("session actor stopped".into()))?;
        on_reply
            .await
            .map_err(|_| Error::Other("session actor dropped the request".into()))
    }

    /// Resolve a pending tool call. Unknown session keys or call ids are
    /// logged and ignored.
    pub async fn deliver_tool_result(
        &self,
        _state: &GatewayState,
        session_key: &str,
        call_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let Some(handle) = self.existing(session_key) else {
            tracing::warn!(session_key = %session_key, call_id = %call_id, "tool result for unknown session ignored");
            return;
        };
        let _ = handle.tx.send(SessionMsg::ToolResult {
            call_id: call_id.to_owned(),
            result,
            error,
        });
    }

    pub async fn reset(&self, state: &GatewayState, session_key: &str) -> Result<ResetOutcome> {
        let handle = self.ensure(state, session_key);
        let (reply, on_reply) = oneshot::channel();
        handle
            .tx
            .send(SessionMsg::Reset { reply })
            .map_err(|_| Error::Other("session actor stopped".into()))?;
        on_reply.await.map_err(|_| Error::Other("session actor dropped the request".into()))?
    }

    pub async fn compact(
        &self,
        state: &GatewayState,
        session_key: &str,
        keep: usize,
    ) -> Result<CompactOutcome> {
        let handle = self.ensure(state, session_key);
        let (reply, on_reply) = oneshot::channel();
        handle
            .tx
            .send(SessionMsg::Compact { keep, reply })
            .map_err(|_| Error::Other("session actor stopped".into()))?;
        on_reply.await.map_err(|_| Error::Other("session actor dropped the request".into()))?
    }

    pub async fn abort(&self, state: &GatewayState, session_key: &str) -> Result<AbortOutcome> {
        // No actor means nothing to abort.
        let Some(handle) = self.existing(session_key) else {
            let _ = state;
            return Ok(AbortOutcome {
                was_running: false,
                run_id: None,
                pending_tools_cancelled: 0,
            });
        };
        let (reply, on_reply) = oneshot::channel();
        handle
            .tx
            .send(SessionMsg::Abort { reply })
            .map_err(|_| Error::Other("session actor stopped".into()))?;
        on_reply
            .await
            .map_err(|_| Error::Other("session actor dropped the request".into()))
    }

    pub async fn patch(
        &self,
        state: &GatewayState,
        session_key: &str,
        patch: SessionPatch,
    ) -> Result<()> {
        let handle = self.ensure(state, session_key);
        let (reply, on_reply) = oneshot::channel();
        handle
            .tx
            .send(SessionMsg::Patch { patch, reply })
            .map_err(|_| Error::Other("session actor stopped".into()))?;
        on_reply.await.map_err(|_| Error::Other("session actor dropped the request".into()))?
    }

    async fn snapshot(
        &self,
        state: &GatewayState,
        session_key: &str,
        kind: SnapshotKind,
    ) -> Result<Value> {
        let handle = self.ensure(state, session_key);
        let (reply, on_reply) = oneshot::channel();
        handle
            .tx
            .send(SessionMsg::Snapshot { kind, reply })
            .map_err(|_| Error::Other("session actor stopped".into()))?;
        on_reply
            .await
            .map_err(|_| Error::Other("session actor dropped the request".into()))
    }

    /// Summary view: ids, counters, settings; no message bodies.
    pub async fn get(&self, state: &GatewayState, session_key: &str) -> Result<Value> {
        self.snapshot(state, session_key, SnapshotKind::Get).await
    }

    pub async fn stats(&self, state: &GatewayState, session_key: &str) -> Result<Value> {
        self.snapshot(state, session_key, SnapshotKind::Stats).await
    }

    /// JSON-plain snapshot of the last few messages.
    pub async fn preview(&self, state: &GatewayState, session_key: &str) -> Result<Value> {
        self.snapshot(state, session_key, SnapshotKind::Preview).await
    }

    pub async fn history(&self, state: &GatewayState, session_key: &str) -> Result<Value> {
        self.snapshot(state, session_key, SnapshotKind::History).await
    }
}
