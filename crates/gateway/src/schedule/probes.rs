//! Node probes — binary-availability checks behind skill eligibility.
//!
//! The gateway queues a `node.probe` per shell-capable node for the bins
//! its skills require. A probe survives node disconnects: on reconnect it is
//! redispatched with the *same* probeId so replays stay idempotent. Two
//! dispatch attempts, then the probe waits for garbage collection at
//! `createdAt + skillProbeMaxAgeMs`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sy_domain::trace::TraceEvent;
use sy_protocol::{Frame, ProbePayload, ProbeResultParams, EVT_NODE_PROBE};
use sy_store::{KvBackend, PersistedMap};

use crate::peers::PeerKey;
use crate::state::GatewayState;

const MAX_ATTEMPTS: u32 = 2;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingProbe {
    pub probe_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub kind: String,
    pub bins: Vec<String>,
    pub timeout_ms: u64,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ProbeStore {
    probes: PersistedMap<PendingProbe>,
}

/// Probed bin availability per connected-or-known node, as the skills
/// registry consumes it.
pub fn host_bins_by_node(state: &GatewayState) -> BTreeMap<String, BTreeMap<String, bool>> {
    state
        .peers
        .node_entries()
        .into_iter()
        .filter_map(|(node_id, entry)| {
            entry.runtime.host_bin_status.map(|bins| (node_id, bins))
        })
        .collect()
}

impl ProbeStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            probes: PersistedMap::new(kv, "probe"),
        }
    }

    pub fn list(&self) -> Vec<PendingProbe> {
        self.probes
            .entries()
            .unwrap_or_default()
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    /// Queue (and dispatch when possible) probes for every shell-capable
    /// node whose bin status doesn't cover the agent's skill requirements.
    pub async fn ensure_probes(&self, state: &GatewayState, agent_id: &str) {
        let config = state.config.typed();
        let bins = match state.skills.required_bins(agent_id, &config.skills) {
            Ok(bins) => bins,
            Err(e) => {
                tracing::warn!(error = %e, "skill enumeration failed, no probes queued");
                return;
            }
        };
        if bins.is_empty() {
            return;
        }
        let max_age = Duration::milliseconds(config.timeouts.skill_probe_max_age_ms as i64);
        let now = Utc::now();

        for node_id in state.peers.shell_capable_node_ids() {
            let covered = state
                .peers
                .node_entry(&node_id)
                .and_then(|entry| {
                    let updated_at = entry.runtime.host_bin_status_updated_at?;
                    let status = entry.runtime.host_bin_status?;
                    Some(
                        now.signed_duration_since(updated_at) < max_age
                            && bins.iter().all(|b| status.contains_key(b)),
                    )
                })
                .unwrap_or(false);
            if covered {
                continue;
            }
            let queued = self
                .list()
                .into_iter()
                .any(|p| p.node_id == node_id && p.agent_id == agent_id && p.bins == bins);
            if queued {
                continue;
            }

            let probe = PendingProbe {
                probe_id: uuid::Uuid::new_v4().to_string(),
                node_id: node_id.clone(),
                agent_id: agent_id.to_owned(),
                kind: "bins".into(),
                bins: bins.clone(),
                timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
                attempts: 0,
                created_at: now,
                sent_at: None,
                expires_at: None,
            };
            if let Err(e) = self.probes.put(&probe.probe_id, probe.clone()) {
                tracing::warn!(error = %e, "failed to persist probe");
                continue;
            }
            self.dispatch(state, &probe).await;
        }
        state.scheduler.reschedule();
    }

    async fn dispatch(&self, state: &GatewayState, probe: &PendingProbe) {
        let key = PeerKey::node(&probe.node_id);
        let Some(sink) = state.peers.sink(&key) else {
            // Node offline: stays queued for the reconnect replay.
            return;
        };
        let payload = ProbePayload {
            probe_id: probe.probe_id.clone(),
            kind: probe.kind.clone(),
            bins: probe.bins.clone(),
            timeout_ms: probe.timeout_ms,
        };
        let frame = Frame::evt(
            EVT_NODE_PROBE,
            serde_json::to_value(&payload).unwrap_or_default(),
        );
        if sink.send(frame).await.is_err() {
            return;
        }
        let now = Utc::now();
        let timeout = Duration::milliseconds(probe.timeout_ms as i64);
        let _ = self.probes.patch(&probe.probe_id, |p| {
            p.attempts += 1;
            p.sent_at = Some(now);
            p.expires_at = Some(now + timeout);
        });
    }

    /// Replay pending-but-unanswered probes for a node that just
    /// reconnected, keeping their probe ids.
    pub async fn on_node_connected(&self, state: &GatewayState, node_id: &str) {
        for probe in self.list().into_iter().filter(|p| p.node_id == node_id) {
            if probe.attempts >= MAX_ATTEMPTS {
                continue;
            }
            TraceEvent::ProbeReplayed {
                probe_id: probe.probe_id.clone(),
                node_id: node_id.to_owned(),
                attempt: probe.attempts + 1,
            }
            .emit();
            self.dispatch(state, &probe).await;
        }
        state.scheduler.reschedule();
    }

    /// Handle a `node.probe.result`.
    pub fn on_result(&self, state: &GatewayState, node_id: &str, params: ProbeResultParams) {
        let Some(probe) = self.probes.get(&params.probe_id).ok().flatten() else {
            tracing::warn!(probe_id = %params.probe_id, "probe result for unknown probe dropped");
            return;
        };
        if probe.node_id != node_id {
            tracing::warn!(
                probe_id = %params.probe_id,
                expected = %probe.node_id,
                got = node_id,
                "probe result from unexpected node dropped"
            );
            return;
        }
        if params.ok {
            if let Err(e) = state.peers.update_bin_status(node_id, &params.bins) {
                tracing::warn!(error = %e, node_id, "failed to record bin status");
            }
            state.skills.invalidate();
        } else {
            state.logs.push(format!(
                "probe {} failed on {node_id}: {}",
                params.probe_id,
                params.error.unwrap_or_else(|| "unknown error".into())
            ));
        }
        let _ = self.probes.remove(&params.probe_id);
        state.scheduler.reschedule();
    }

    /// Timeout retries and age-based GC; called from the alarm loop.
    pub async fn tick(&self, state: &GatewayState, now: DateTime<Utc>) {
        let max_age = Duration::milliseconds(
            state.config.typed().timeouts.skill_probe_max_age_ms as i64,
        );
        for probe in self.list() {
            if now.signed_duration_since(probe.created_at) >= max_age {
                let _ = self.probes.remove(&probe.probe_id);
                state
                    .logs
                    .push(format!("probe {} aged out", probe.probe_id));
                continue;
            }
            let expired = probe.expires_at.map(|at| at <= now).unwrap_or(false);
            if expired && probe.attempts < MAX_ATTEMPTS {
                self.dispatch(state, &probe).await;
            }
        }
    }

    pub fn next_fire(&self, state: &GatewayState) -> Option<DateTime<Utc>> {
        let max_age = Duration::milliseconds(
            state.config.typed().timeouts.skill_probe_max_age_ms as i64,
        );
        let mut next: Option<DateTime<Utc>> = None;
        let mut consider = |t: DateTime<Utc>| {
            next = Some(match next {
                Some(current) if current <= t => current,
                _ => t,
            });
        };
        for probe in self.list() {
            consider(probe.created_at + max_age);
            if let Some(expires_at) = probe.expires_at {
                if probe.attempts < MAX_ATTEMPTS {
                    consider(expires_at);
                }
            }
        }
        next
    }
}
