//! Peer registry — one live socket per `(mode, id)`.
//!
//! Reconnects replace the prior socket; the replaced socket's close must not
//! fire side effects, which the generation counter guarantees ("stale
//! socket" rule). Node tool/runtime entries persist *detached* from the
//! socket and survive reconnects; they are only removed on explicit
//! disconnect or desync eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use sy_domain::tool::{Capability, NodeRuntime, ToolDefinition};
use sy_domain::trace::TraceEvent;
use sy_protocol::{Frame, PeerMode};
use sy_store::{KvBackend, PersistedMap};

/// A message the gateway can push to a connected peer's WebSocket.
pub type PeerSink = mpsc::Sender<Frame>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub mode: PeerMode,
    pub id: String,
}

impl PeerKey {
    pub fn new(mode: PeerMode, id: impl Into<String>) -> Self {
        Self {
            mode,
            id: id.into(),
        }
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(PeerMode::Client, id)
    }

    pub fn node(id: impl Into<String>) -> Self {
        Self::new(PeerMode::Node, id)
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::new(PeerMode::Channel, id)
    }
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.mode, self.id)
    }
}

#[derive(Clone)]
pub struct PeerHandle {
    pub key: PeerKey,
    pub generation: u64,
    pub sink: PeerSink,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Channel peers: account within the adapter (`channelId:accountId`).
    pub account_id: Option<String>,
    pub display_name: Option<String>,
}

/// Detached node registry entry, persisted under `node:{nodeId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub tools: Vec<ToolDefinition>,
    pub runtime: NodeRuntime,
    pub updated_at: DateTime<Utc>,
}

pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerKey, PeerHandle>>,
    next_generation: AtomicU64,
    nodes: PersistedMap<NodeEntry>,
}

impl PeerRegistry {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            nodes: PersistedMap::new(kv, "node"),
        }
    }

    /// Register a connected peer. Any prior socket under the same key is
    /// replaced; its later close is ignored via the generation check.
    pub fn register(
        &self,
        key: PeerKey,
        sink: PeerSink,
        account_id: Option<String>,
        display_name: Option<String>,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let handle = PeerHandle {
            key: key.clone(),
            generation,
            sink,
            connected_at: now,
            last_seen: now,
            account_id,
            display_name,
        };
        let replaced = self.peers.write().insert(key.clone(), handle).is_some();
        if replaced {
            tracing::info!(peer = %key, "replaced stale socket on reconnect");
        }
        generation
    }

    /// Remove the peer only when the closing socket is still the live one.
    /// Returns `false` for a stale close (already replaced), which callers
    /// must treat as a no-op.
    pub fn remove_if_current(&self, key: &PeerKey, generation: u64) -> bool {
        let mut peers = self.peers.write();
        match peers.get(key) {
            Some(handle) if handle.generation == generation => {
                peers.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn touch(&self, key: &PeerKey) {
        if let Some(handle) = self.peers.write().get_mut(key) {
            handle.last_seen = Utc::now();
        }
    }

    pub fn is_connected(&self, key: &PeerKey) -> bool {
        self.peers.read().contains_key(key)
    }

    pub fn get(&self, key: &PeerKey) -> Option<PeerHandle> {
        self.peers.read().get(key).cloned()
    }

    pub fn sink(&self, key: &PeerKey) -> Option<PeerSink> {
        self.peers.read().get(key).map(|h| h.sink.clone())
    }

    /// Fire-and-forget send; a full or closed sink is logged and dropped.
    pub fn send(&self, key: &PeerKey, frame: Frame) {
        let Some(sink) = self.sink(key) else {
            tracing::debug!(peer = %key, "send to disconnected peer dropped");
            return;
        };
        if let Err(e) = sink.try_send(frame) {
            tracing::warn!(peer = %key, error = %e, "peer sink full or closed, frame dropped");
        }
    }

    /// Broadcast an event frame to every connected client.
    pub fn broadcast_clients(&self, frame: &Frame) {
        for handle in self.peers.read().values() {
            if handle.key.mode == PeerMode::Client {
                if let Err(e) = handle.sink.try_send(frame.clone()) {
                    tracing::debug!(peer = %handle.key, error = %e, "client broadcast dropped");
                }
            }
        }
    }

    pub fn connected_keys(&self, mode: PeerMode) -> Vec<PeerKey> {
        self.peers
            .read()
            .keys()
            .filter(|k| k.mode == mode)
            .cloned()
            .collect()
    }

    /// Evict peers silent for longer than `timeout_secs`. Returns the
    /// evicted keys so callers can fail their in-flight work.
    pub fn prune_stale(&self, timeout_secs: i64) -> Vec<PeerKey> {
        let now = Utc::now();
        let mut evicted = Vec::new();
        let mut peers = self.peers.write();
        peers.retain(|key, handle| {
            let age = now.signed_duration_since(handle.last_seen).num_seconds();
            if age >= timeout_secs {
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });
        drop(peers);
        for key in &evicted {
            TraceEvent::PeerEvicted {
                mode: key.mode.to_string(),
                peer_id: key.id.clone(),
                reason: "stale".into(),
            }
            .emit();
        }
        evicted
    }

    // ── Detached node registry ─────────────────────────────────────

    pub fn put_node_entry(
        &self,
        node_id: &str,
        tools: Vec<ToolDefinition>,
        runtime: NodeRuntime,
    ) -> sy_domain::Result<()> {
        TraceEvent::PeerConnected {
            mode: "node".into(),
            peer_id: node_id.to_owned(),
            tools: tools.len(),
        }
        .emit();
        self.nodes.put(
            node_id,
            NodeEntry {
                tools,
                runtime,
                updated_at: Utc::now(),
            },
        )
    }

    pub fn node_entry(&self, node_id: &str) -> Option<NodeEntry> {
        self.nodes.get(node_id).ok().flatten()
    }

    /// Explicit disconnect or desync eviction only; socket closes keep the
    /// entry so reconnects are transparent.
    pub fn remove_node_entry(&self, node_id: &str) -> sy_domain::Result<()> {
        self.nodes.remove(node_id)
    }

    pub fn node_entries(&self) -> Vec<(String, NodeEntry)> {
        self.nodes.entries().unwrap_or_default()
    }

    /// Does a *connected* node currently advertise `tool`?
    pub fn node_advertises(&self, node_id: &str, tool: &str) -> bool {
        if !self.is_connected(&PeerKey::node(node_id)) {
            return false;
        }
        self.node_entry(node_id)
            .map(|entry| entry.tools.iter().any(|t| t.name == tool))
            .unwrap_or(false)
    }

    /// The unique execution host. With multiple candidates (a
    /// misconfiguration) the latest connect wins, ties broken by id, so the
    /// choice is deterministic.
    pub fn execution_node_id(&self) -> Option<String> {
        let peers = self.peers.read();
        peers
            .values()
            .filter(|h| h.key.mode == PeerMode::Node)
            .filter(|h| {
                self.node_entry(&h.key.id)
                    .map(|e| e.runtime.host_role == sy_domain::tool::HostRole::Execution)
                    .unwrap_or(false)
            })
            .max_by(|a, b| {
                a.connected_at
                    .cmp(&b.connected_at)
                    .then_with(|| a.key.id.cmp(&b.key.id))
            })
            .map(|h| h.key.id.clone())
    }

    /// Connected nodes whose runtime can run shell probes.
    pub fn shell_capable_node_ids(&self) -> Vec<String> {
        self.connected_keys(PeerMode::Node)
            .into_iter()
            .filter(|key| {
                self.node_entry(&key.id)
                    .map(|e| e.runtime.host_capabilities.contains(&Capability::ShellExec))
                    .unwrap_or(false)
            })
            .map(|key| key.id)
            .collect()
    }

    /// Merge probed bin availability into the node's persisted runtime.
    pub fn update_bin_status(
        &self,
        node_id: &str,
        bins: &std::collections::BTreeMap<String, bool>,
    ) -> sy_domain::Result<bool> {
        self.nodes.patch(node_id, |entry| {
            let status = entry.runtime.host_bin_status.get_or_insert_with(Default::default);
            for (bin, present) in bins {
                status.insert(bin.clone(), *present);
            }
            entry.runtime.host_bin_status_updated_at = Some(Utc::now());
            entry.updated_at = Utc::now();
        })
    }
}
