//! Channel inbound pipeline.
//!
//! Every inbound message walks the same steps: dedupe, admission (dmPolicy),
//! agent binding, session-key derivation, registry updates, slash commands,
//! inline directives, media processing, envelope, dispatch. Registry updates
//! run for every admitted inbound, slash commands included, so cron and
//! heartbeat delivery can later target the right peer.

use chrono::Utc;
use serde_json::{json, Value};

use sy_domain::channel::{ChannelInboundMessage, ChannelOutboundMessage, PeerKind};
use sy_domain::config::{DmPolicy, GatewayConfig};
use sy_domain::error::Result;
use sy_protocol::ChannelInboundParams;
use sy_sessions::{
    normalize_sender_id, session_key_for_peer, ChannelRegistryEntry, IdentityResolver,
    LastActiveContext, SessionRegistryEntry,
};

use crate::channels::{send_outbound, set_typing, PendingChannelResponse};
use crate::runtime::commands::{execute_command, parse_command};
use crate::runtime::directives::parse_directives;
use crate::runtime::{ChannelContext, SendOverrides, SessionPatch};
use crate::state::GatewayState;

pub async fn handle_channel_inbound(
    state: &GatewayState,
    params: ChannelInboundParams,
) -> Result<Value> {
    let ChannelInboundParams {
        channel_id: channel,
        account_id,
        message,
    } = params;
    let config = state.config.typed();

    // Webhook retries and reconnect replays die here.
    let dedupe_key = format!("{channel}:{account_id}:{}", message.message_id);
    if state.dedupe.check_and_insert(&dedupe_key) {
        return Ok(json!({"status": "duplicate"}));
    }

    // ── 1. Admission ───────────────────────────────────────────────
    let effective_sender = message
        .sender
        .as_ref()
        .map(|s| s.id.clone())
        .unwrap_or_else(|| message.peer.id.clone());
    let sender_id = normalize_sender_id(&effective_sender);

    if message.peer.kind == PeerKind::Dm {
        let channel_config = config.channels.get(&channel).cloned().unwrap_or_default();
        let allowed = channel_config
            .allow_from
            .iter()
            .any(|entry| normalize_sender_id(entry) == sender_id);
        match channel_config.dm_policy {
            DmPolicy::Open => {}
            DmPolicy::Allowlist if allowed => {}
            DmPolicy::Allowlist => {
                return Ok(json!({"status": "blocked"}));
            }
            DmPolicy::Pairing if allowed => {}
            DmPolicy::Pairing => {
                let first = state.pairing.hold(
                    &channel,
                    &sender_id,
                    message.sender.as_ref().and_then(|s| s.name.clone()),
                    Some(message.text.clone()),
                )?;
                if first {
                    let reply = ChannelOutboundMessage {
                        peer: message.peer.clone(),
                        text: "Your message is awaiting approval.".into(),
                        media: Vec::new(),
                        reply_to_id: Some(message.message_id.clone()),
                    };
                    if let Err(e) = send_outbound(state, &channel, &account_id, reply).await {
                        tracing::warn!(error = %e, channel = %channel, "pairing hold reply failed");
                    }
                }
                return Ok(json!({"status": "pending_pairing"}));
            }
        }
    }

    // ── 2. Agent resolution ────────────────────────────────────────
    let agent_id = resolve_agent(&config, &channel, &account_id, &message);

    // ── 3. Session key ─────────────────────────────────────────────
    let resolver = IdentityResolver::from_config(&config.session.identity_links);
    let linked_peer_id = resolver.resolve(&message.peer.id);
    let session_key = session_key_for_peer(
        &agent_id,
        &channel,
        &account_id,
        &message.peer,
        &linked_peer_id,
        config.session.dm_scope,
        &config.session.main_key,
    );

    // ── 4. Registry updates (every admitted inbound) ───────────────
    let now = Utc::now();
    update_registries(state, &channel, &account_id, &session_key, &agent_id, &message, now)?;

    // ── 5. Slash commands ──────────────────────────────────────────
    if let Some((command, args)) = parse_command(&message.text) {
        let outcome = match execute_command(state, &state.sessions, &session_key, command, &args)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let reply = ChannelOutboundMessage {
                    peer: message.peer.clone(),
                    text: e.to_string(),
                    media: Vec::new(),
                    reply_to_id: Some(message.message_id.clone()),
                };
                let _ = send_outbound(state, &channel, &account_id, reply).await;
                return Ok(json!({"status": "command_error", "error": e.to_string()}));
            }
        };
        let reply = ChannelOutboundMessage {
            peer: message.peer.clone(),
            text: outcome.response.clone(),
            media: Vec::new(),
            reply_to_id: Some(message.message_id.clone()),
        };
        if let Err(e) = send_outbound(state, &channel, &account_id, reply).await {
            tracing::warn!(error = %e, channel = %channel, "command reply failed");
        }
        return Ok(json!({
            "status": "command",
            "command": outcome.command,
            "response": outcome.response,
        }));
    }

    // ── 6. Directives ──────────────────────────────────────────────
    let directives = parse_directives(&message.text);
    if directives.status_requested && directives.directive_only {
        let outcome = execute_command(
            state,
            &state.sessions,
            &session_key,
            crate::runtime::commands::SlashCommand::Status,
            "",
        )
        .await?;
        let reply = ChannelOutboundMessage {
            peer: message.peer.clone(),
            text: outcome.response.clone(),
            media: Vec::new(),
            reply_to_id: Some(message.message_id.clone()),
        };
        let _ = send_outbound(state, &channel, &account_id, reply).await;
        return Ok(json!({"status": "command", "command": "status", "response": outcome.response}));
    }
    if directives.directive_only {
        // Sticky: a directive-only message updates the session defaults.
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
            .await?;
        let reply = ChannelOutboundMessage {
            peer: message.peer.clone(),
            text: "Settings updated.".into(),
            media: Vec::new(),
            reply_to_id: Some(message.message_id.clone()),
        };
        let _ = send_outbound(state, &channel, &account_id, reply).await;
        return Ok(json!({"status": "directive"}));
    }

    // ── 7. Media ───────────────────────────────────────────────────
    let media = crate::channels::media::process_media(state, &session_key, message.media.clone())
        .await?;

    // ── 8. Envelope ────────────────────────────────────────────────
    let tz = crate::runtime::session::resolve_tz(config.user_timezone.as_deref());
    let local_time = now.with_timezone(&tz).format("%H:%M").to_string();
    let sender_name = message
        .sender
        .as_ref()
        .and_then(|s| s.name.clone())
        .or_else(|| message.peer.name.clone())
        .unwrap_or_else(|| sender_id.clone());
    let mut envelope = format!(
        "[{channel} · {local_time} · peer={} · sender={sender_name}]\n{}",
        message.peer.kind, directives.cleaned
    );
    if let Some(reply_to) = &message.reply_to_text {
        envelope.push_str(&format!("\n(replying to: {reply_to})"));
    }

    // ── 9. Dispatch ────────────────────────────────────────────────
    let run_id = uuid::Uuid::new_v4().to_string();
    state.pending_responses.put(
        &run_id,
        PendingChannelResponse {
            channel: channel.clone(),
            account_id: account_id.clone(),
            peer: message.peer.clone(),
            inbound_message_id: message.message_id.clone(),
            agent_id: Some(agent_id.clone()),
            is_heartbeat: false,
            created_at: now,
        },
    )?;
    set_typing(state, &channel, &account_id, &message.peer, true).await;

    let overrides = SendOverrides {
        model: directives.model.clone(),
        think_level: directives.think_level,
    };
    let context = ChannelContext {
        channel: channel.clone(),
        account_id: account_id.clone(),
        peer: message.peer.clone(),
    };
    let send = state
        .sessions
        .chat_send(
            state,
            &session_key,
            envelope,
            run_id.clone(),
            overrides,
            media,
            Some(context),
        )
        .await;

    match send {
        Ok(outcome) => {
            // Probes ride along: a fresh inbound is a good moment to make
            // sure skill eligibility is current.
            state.probes.ensure_probes(state, &agent_id).await;
            Ok(json!({
                "status": outcome.status,
                "runId": run_id,
                "sessionKey": session_key,
            }))
        }
        Err(e) => {
            set_typing(state, &channel, &account_id, &message.peer, false).await;
            let _ = state.pending_responses.remove(&run_id);
            Err(e)
        }
    }
}

fn resolve_agent(
    config: &GatewayConfig,
    channel: &str,
    account_id: &str,
    message: &ChannelInboundMessage,
) -> String {
    for binding in &config.agents.bindings {
        let channel_ok = binding.channel.as_deref().map(|c| c == channel).unwrap_or(true);
        let account_ok = binding
            .account_id
            .as_deref()
            .map(|a| a == account_id)
            .unwrap_or(true);
        let kind_ok = binding
            .peer_kind
            .as_deref()
            .map(|k| k == message.peer.kind.to_string())
            .unwrap_or(true);
        let peer_ok = binding
            .peer_id
            .as_deref()
            .map(|p| p == message.peer.id)
            .unwrap_or(true);
        if channel_ok && account_ok && kind_ok && peer_ok {
            return binding.agent_id.clone();
        }
    }
    config.default_agent_id()
}

fn update_registries(
    state: &GatewayState,
    channel: &str,
    account_id: &str,
    session_key: &str,
    agent_id: &str,
    message: &ChannelInboundMessage,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let channel_key = format!("{channel}:{account_id}");
    let updated = state.channel_index.patch(&channel_key, |entry| {
        entry.last_message_at = Some(now);
    })?;
    if !updated {
        state.channel_index.put(
            &channel_key,
            ChannelRegistryEntry {
                channel: channel.to_owned(),
                account_id: account_id.to_owned(),
                connected_at: now,
                last_message_at: Some(now),
            },
        )?;
    }

    let updated = state.session_index.patch(session_key, |entry| {
        entry.last_active_at = now;
    })?;
    if !updated {
        state.session_index.put(
            session_key,
            SessionRegistryEntry {
                session_key: session_key.to_owned(),
                created_at: now,
                last_active_at: now,
                label: None,
            },
        )?;
    }

    state.last_active.put(
        agent_id,
        LastActiveContext {
            channel: channel.to_owned(),
            account_id: account_id.to_owned(),
            peer: message.peer.clone(),
            session_key: session_key.to_owned(),
            timestamp: now,
        },
    )?;
    Ok(())
}
