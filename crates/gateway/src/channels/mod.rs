//! Channel plumbing: the adapter contract, the inbound pipeline, pairing,
//! media processing, and the reply router.

pub mod inbound;
pub mod media;
pub mod pairing;
pub mod replies;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sy_domain::channel::{ChannelOutboundMessage, PeerRef};
use sy_domain::error::{Error, Result};
use sy_protocol::{Frame, EVT_CHANNEL_SEND, EVT_CHANNEL_TYPING};

use crate::peers::PeerKey;
use crate::state::GatewayState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-process channel adapter stub (the service-binding RPC analog). When an
/// adapter is registered for a channel, replies route through it; otherwise
/// they go out over the channel peer's WebSocket.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn send(
        &self,
        account_id: &str,
        message: ChannelOutboundMessage,
    ) -> Result<Option<String>>;

    async fn set_typing(&self, _account_id: &str, _peer: &PeerRef, _typing: bool) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _account_id: &str, _config: Value) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _account_id: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _account_id: Option<&str>) -> Result<Value> {
        Ok(Value::Null)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending channel responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the output of one agent run goes. Keyed by `runId`; lifetime
/// bounded by the run: cleaned on final/error or send failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChannelResponse {
    pub channel: String,
    pub account_id: String,
    pub peer: PeerRef,
    pub inbound_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Heartbeat runs get ack suppression and 24h dedup.
    #[serde(default)]
    pub is_heartbeat: bool,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound idempotency
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory idempotency store. Tracks seen message keys with a TTL to
/// drop webhook retries, reconnect replays, and polling duplicates before
/// they reach admission.
pub struct DedupeStore {
    seen: parking_lot::Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: parking_lot::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` if this key was already seen (duplicate).
    pub fn check_and_insert(&self, key: &str) -> bool {
        let mut map = self.seen.lock();
        let now = Instant::now();

        // Lazy cleanup when the map grows large.
        if map.len() > 10_000 {
            let ttl = self.ttl;
            map.retain(|_, ts| now.duration_since(*ts) < ttl);
        }

        if let Some(ts) = map.get(key) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }
        map.insert(key.to_owned(), now);
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Send one outbound message: registered adapter first, channel WebSocket
/// otherwise. Returns the platform message id when the adapter reports one.
pub async fn send_outbound(
    state: &GatewayState,
    channel: &str,
    account_id: &str,
    message: ChannelOutboundMessage,
) -> Result<Option<String>> {
    let adapter = state.adapters.read().get(channel).cloned();
    if let Some(adapter) = adapter {
        return adapter.send(account_id, message).await;
    }

    let key = PeerKey::channel(channel);
    let Some(sink) = state.peers.sink(&key) else {
        return Err(Error::Channel(format!(
            "channel {channel} has no adapter and no connected socket"
        )));
    };
    let payload = serde_json::json!({
        "accountId": account_id,
        "message": message,
    });
    sink.send(Frame::evt(EVT_CHANNEL_SEND, payload))
        .await
        .map_err(|_| Error::Channel(format!("channel {channel} socket closed")))?;
    Ok(None)
}

/// Fire-and-forget typing indicator; failures are logged only.
pub async fn set_typing(
    state: &GatewayState,
    channel: &str,
    account_id: &str,
    peer: &PeerRef,
    typing: bool,
) {
    let adapter = state.adapters.read().get(channel).cloned();
    if let Some(adapter) = adapter {
        if let Err(e) = adapter.set_typing(account_id, peer, typing).await {
            tracing::debug!(channel, error = %e, "setTyping failed");
        }
        return;
    }
    let key = PeerKey::channel(channel);
    let payload: Value = serde_json::json!({
        "accountId": account_id,
        "peer": peer,
        "typing": typing,
    });
    state.peers.send(&key, Frame::evt(EVT_CHANNEL_TYPING, payload));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_drops_replays_within_ttl() {
        let store = DedupeStore::new(Duration::from_secs(60));
        assert!(!store.check_and_insert("wa:acc:m1"));
        assert!(store.check_and_insert("wa:acc:m1"));
        assert!(!store.check_and_insert("wa:acc:m2"));
    }

    #[test]
    fn dedupe_expires() {
        let store = DedupeStore::new(Duration::from_millis(1));
        assert!(!store.check_and_insert("k"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!store.check_and_insert("k"));
    }
}
