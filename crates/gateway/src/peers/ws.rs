//! WebSocket endpoint for all peers.
//!
//! Flow:
//! 1. Peer connects to `GET /ws` and upgrades.
//! 2. Peer sends a `connect` req (the only method allowed pre-connect).
//! 3. Gateway validates (protocol, token, nodeRuntime) and registers the
//!    peer; a reconnect replaces the prior socket, whose close is then
//!    ignored.
//! 4. Bidirectional frame loop until close; malformed frames are logged and
//!    dropped without closing the socket.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use sy_protocol::{Frame, PeerMode, RpcError, MAX_FRAME_BYTES, PROTOCOL_VERSION};

use crate::peers::dispatch::{process_frame, validate_connect};
use crate::peers::PeerKey;
use crate::state::GatewayState;

pub async fn gateway_ws(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: forwards outbound frames to the WS sink.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut connected: Option<(PeerKey, u64)> = None;

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    tracing::warn!(bytes = text.len(), "oversized frame dropped");
                    continue;
                }
                let frame = match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed frame ignored");
                        continue;
                    }
                };
                match &connected {
                    None => {
                        if let Some(accepted) =
                            handle_preconnect(&state, &outbound_tx, frame).await
                        {
                            connected = Some(accepted);
                        }
                    }
                    Some((key, _generation)) => {
                        // Desync guard: a node whose registry entry vanished
                        // is evicted rather than served.
                        if key.mode == PeerMode::Node && state.peers.node_entry(&key.id).is_none()
                        {
                            tracing::warn!(
                                peer = %key,
                                close_code = sy_protocol::CLOSE_DESYNC,
                                "node registry entry missing, evicting desynced socket"
                            );
                            break;
                        }
                        state.peers.touch(key);
                        if let Some(res) = process_frame(&state, key, frame).await {
                            if outbound_tx.send(res).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                if let Some((key, _)) = &connected {
                    state.peers.touch(key);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();

    // A close from a replaced socket must not fire side effects.
    if let Some((key, generation)) = connected {
        if !state.peers.remove_if_current(&key, generation) {
            tracing::debug!(peer = %key, "stale socket close ignored");
            return;
        }
        match key.mode {
            PeerMode::Node => {
                // Detached tool/runtime entry is preserved for a transparent
                // reconnect; only in-flight work fails.
                let failed = state.tools.fail_pending_for_node(&state, &key.id).await;
                tracing::info!(peer = %key, failed_in_flight = failed, "node disconnected");
            }
            PeerMode::Client => {
                let dropped = state.tools.drop_client_pendings(&key.id);
                tracing::info!(peer = %key, dropped_pendings = dropped, "client disconnected");
            }
            PeerMode::Channel => {
                tracing::info!(peer = %key, "channel adapter disconnected");
            }
        }
    }
}

/// Pre-connect state: only `connect` is served; other reqs answer 101.
async fn handle_preconnect(
    state: &GatewayState,
    outbound_tx: &mpsc::Sender<Frame>,
    frame: Frame,
) -> Option<(PeerKey, u64)> {
    match frame {
        Frame::Req { id, method, params } if method == "connect" => {
            let accept = match validate_connect(state, params.unwrap_or(Value::Null)) {
                Ok(accept) => accept,
                Err(error) => {
                    let _ = outbound_tx.send(Frame::err(id, error)).await;
                    return None;
                }
            };

            let generation = state.peers.register(
                accept.key.clone(),
                outbound_tx.clone(),
                accept.account_id.clone(),
                accept.display_name.clone(),
            );

            match accept.key.mode {
                PeerMode::Node => {
                    if let Some(runtime) = accept.node_runtime {
                        if let Err(e) =
                            state
                                .peers
                                .put_node_entry(&accept.key.id, accept.tools, runtime)
                        {
                            tracing::warn!(error = %e, "failed to persist node entry");
                        }
                    }
                    // Unsent probes replay with their original ids; new
                    // requirements get fresh probes.
                    state.probes.on_node_connected(state, &accept.key.id).await;
                    let agent_id = state.config.typed().default_agent_id();
                    state.probes.ensure_probes(state, &agent_id).await;
                }
                PeerMode::Channel => {
                    let account_id = accept.account_id.clone().unwrap_or_default();
                    let channel_key = format!("{}:{account_id}", accept.key.id);
                    let now = chrono::Utc::now();
                    let updated = state
                        .channel_index
                        .patch(&channel_key, |entry| entry.connected_at = now)
                        .unwrap_or(false);
                    if !updated {
                        let _ = state.channel_index.put(
                            &channel_key,
                            sy_sessions::ChannelRegistryEntry {
                                channel: accept.key.id.clone(),
                                account_id,
                                connected_at: now,
                                last_message_at: None,
                            },
                        );
                    }
                }
                PeerMode::Client => {}
            }

            let _ = outbound_tx
                .send(Frame::ok(
                    id,
                    serde_json::json!({"ok": true, "protocol": PROTOCOL_VERSION}),
                ))
                .await;
            Some((accept.key, generation))
        }
        Frame::Req { id, method, .. } => {
            tracing::debug!(method = %method, "request before connect rejected");
            let _ = outbound_tx
                .send(Frame::err(id, RpcError::not_connected()))
                .await;
            None
        }
        _ => {
            tracing::debug!("non-req frame before connect ignored");
            None
        }
    }
}
