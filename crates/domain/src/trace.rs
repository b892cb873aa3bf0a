use serde::Serialize;

/// Structured trace events emitted across all Switchyard crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    PeerConnected {
        mode: String,
        peer_id: String,
        tools: usize,
    },
    PeerEvicted {
        mode: String,
        peer_id: String,
        reason: String,
    },
    SessionResolved {
        session_key: String,
        session_id: String,
        is_new: bool,
    },
    SessionReset {
        session_key: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
    },
    TranscriptArchived {
        session_id: String,
        messages: usize,
        blob_key: String,
    },
    ToolRouted {
        call_id: String,
        tool: String,
        node_id: String,
    },
    ProbeReplayed {
        probe_id: String,
        node_id: String,
        attempt: u32,
    },
    ExecEventDeduped {
        event_id: String,
    },
    CronFired {
        job_id: String,
        mode: String,
    },
    HeartbeatRun {
        agent_id: String,
        delivered: bool,
    },
    PairingHeld {
        channel: String,
        sender_id: String,
    },
    IdentityResolved {
        raw_peer_id: String,
        canonical: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sy_event");
    }
}
