//! Reply router.
//!
//! Consumes `chat` events from session actors. Every event is broadcast to
//! subscribed clients; events carrying a `runId` with a pending channel
//! response are additionally routed to the originating channel. Routing is
//! serialized per run by the single consumer task: partials precede the
//! final, nothing routes after final.

use serde_json::Value;

use sy_domain::channel::ChannelOutboundMessage;
use sy_protocol::{ChatEventPayload, ChatState, Frame, EVT_CHAT};

use crate::channels::{send_outbound, set_typing, PendingChannelResponse};
use crate::state::GatewayState;

pub async fn run_reply_router(
    state: GatewayState,
    mut rx: tokio::sync::broadcast::Receiver<ChatEventPayload>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => handle_chat_event(&state, event).await,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "reply router lagged, chat events dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

pub async fn handle_chat_event(state: &GatewayState, event: ChatEventPayload) {
    // Subscribed clients always see the event stream.
    let frame = Frame::evt(
        EVT_CHAT,
        serde_json::to_value(&event).unwrap_or(Value::Null),
    );
    state.peers.broadcast_clients(&frame);

    let Some(run_id) = event.run_id.clone() else {
        return;
    };
    let Some(pending) = state.pending_responses.get(&run_id).ok().flatten() else {
        return;
    };

    match event.state {
        ChatState::Partial => {
            if let Some(text) = deliverable_text(state, &pending, &event.message) {
                if !route_text(state, &pending, text).await {
                    let _ = state.pending_responses.remove(&run_id);
                }
            }
        }
        ChatState::Final => {
            set_typing(
                state,
                &pending.channel,
                &pending.account_id,
                &pending.peer,
                false,
            )
            .await;
            if let Some(text) = deliverable_text(state, &pending, &event.message) {
                route_text(state, &pending, text).await;
            }
            let _ = state.pending_responses.remove(&run_id);
        }
        ChatState::Error => {
            // Session errors never reach the channel as text; typing just
            // stops.
            set_typing(
                state,
                &pending.channel,
                &pending.account_id,
                &pending.peer,
                false,
            )
            .await;
            let _ = state.pending_responses.remove(&run_id);
        }
    }
}

/// Extract routable text: text blocks joined, leading blank lines trimmed,
/// heartbeat filtering applied. `None` means nothing goes out.
fn deliverable_text(
    state: &GatewayState,
    pending: &PendingChannelResponse,
    message: &Option<Value>,
) -> Option<String> {
    let message = message.as_ref()?;
    let blocks = message.get("content")?.as_array()?;
    let mut text = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(part) = block.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(part);
            }
        }
    }
    let trimmed = text.trim_start_matches('\n').trim_end().to_owned();
    if trimmed.is_empty() {
        return None;
    }
    if pending.is_heartbeat {
        let agent_id = pending.agent_id.as_deref().unwrap_or("main");
        return state.heartbeats.filter_response(agent_id, &trimmed);
    }
    Some(trimmed)
}

/// Fire-and-forget route to the channel; returns false on send failure.
async fn route_text(
    state: &GatewayState,
    pending: &PendingChannelResponse,
    text: String,
) -> bool {
    let outbound = ChannelOutboundMessage {
        peer: pending.peer.clone(),
        text,
        media: Vec::new(),
        reply_to_id: Some(pending.inbound_message_id.clone()),
    };
    match send_outbound(state, &pending.channel, &pending.account_id, outbound).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(
                channel = %pending.channel,
                error = %e,
                "reply routing failed"
            );
            false
        }
    }
}
