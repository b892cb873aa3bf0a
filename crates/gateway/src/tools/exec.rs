//! Async-exec tracker.
//!
//! A long-running shell exec outlives its original tool call: the node
//! reports `started` / `finished` / `failed` / `timed_out` later via
//! `node.exec.event`. Terminal events are queued as deliveries to the
//! originating session with exponential backoff, and a delivered-events set
//! makes ingestion idempotent for 24 hours, so retries at any layer are safe.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sy_domain::trace::TraceEvent;
use sy_protocol::{ExecEventKind, ExecEventParams};
use sy_store::{KvBackend, PersistedMap};

use crate::state::GatewayState;

const PENDING_TTL_HOURS: i64 = 24;
const DELIVERED_TTL_HOURS: i64 = 24;
const RETRY_BASE_SECS: i64 = 1;
const RETRY_CAP_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExecSession {
    pub node_id: String,
    pub session_id: String,
    pub session_key: String,
    pub call_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExecDelivery {
    pub event_id: String,
    pub session_key: String,
    pub event: ExecEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredEvent {
    pub at: DateTime<Utc>,
}

pub struct ExecTracker {
    sessions: PersistedMap<PendingExecSession>,
    deliveries: PersistedMap<PendingExecDelivery>,
    delivered: PersistedMap<DeliveredEvent>,
}

/// Stable dedup id for a terminal event: explicit when the node sent one,
/// otherwise a hash of the full event tuple.
pub fn derive_event_id(node_id: &str, params: &ExecEventParams) -> String {
    if let Some(explicit) = &params.event_id {
        return explicit.clone();
    }
    let tuple = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        node_id,
        params.session_id,
        params.event.as_str(),
        params.call_id.as_deref().unwrap_or(""),
        params.started_at.map(|t| t.timestamp_millis()).unwrap_or(0),
        params.ended_at.map(|t| t.timestamp_millis()).unwrap_or(0),
        params.exit_code.unwrap_or(i64::MIN),
        params.signal.as_deref().unwrap_or(""),
    );
    hex::encode(Sha256::digest(tuple.as_bytes()))
}

impl ExecTracker {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            sessions: PersistedMap::new(kv.clone(), "execsess"),
            deliveries: PersistedMap::new(kv.clone(), "execdelivery"),
            delivered: PersistedMap::new(kv, "execdone"),
        }
    }

    /// Register a pending exec session at dispatch time. The call id doubles
    /// as the exec session id until the node reports its own.
    pub fn register(&self, node_id: &str, call_id: &str, session_key: &str) {
        let now = Utc::now();
        let record = PendingExecSession {
            node_id: node_id.to_owned(),
            session_id: call_id.to_owned(),
            session_key: session_key.to_owned(),
            call_id: call_id.to_owned(),
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(PENDING_TTL_HOURS),
        };
        if let Err(e) = self.sessions.put(call_id, record) {
            tracing::warn!(error = %e, call_id = %call_id, "failed to persist pending exec session");
        }
    }

    fn find(&self, params: &ExecEventParams) -> Option<(String, PendingExecSession)> {
        if let Ok(Some(found)) = self.sessions.get(&params.session_id) {
            return Some((params.session_id.clone(), found));
        }
        let call_id = params.call_id.as_deref()?;
        self.sessions
            .entries()
            .unwrap_or_default()
            .into_iter()
            .find(|(_, s)| s.call_id == call_id)
    }

    /// Ingest a `node.exec.event`. Terminal events enqueue exactly one
    /// delivery; replays at any layer dedup against the delivered set and
    /// the queue itself.
    pub fn on_exec_event(&self, state: &GatewayState, node_id: &str, params: ExecEventParams) {
        let now = Utc::now();
        let found = self.find(&params);

        if params.event == ExecEventKind::Started {
            if let Some((id, _)) = found {
                let _ = self.sessions.patch(&id, |s| {
                    // A node-side session id may differ from the call id.
                    s.session_id = params.session_id.clone();
                    s.updated_at = now;
                    s.expires_at = now + Duration::hours(PENDING_TTL_HOURS);
                });
            } else {
                tracing::debug!(session_id = %params.session_id, "exec started for unknown session");
            }
            return;
        }

        let event_id = derive_event_id(node_id, &params);
        let already_delivered = self.delivered.get(&event_id).ok().flatten().is_some();
        let already_queued = self.deliveries.get(&event_id).ok().flatten().is_some();
        if already_delivered || already_queued {
            TraceEvent::ExecEventDeduped {
                event_id: event_id.clone(),
            }
            .emit();
            return;
        }

        let Some((pending_id, pending)) = found else {
            state.logs.push(format!(
                "exec event {} for unknown session {} dropped",
                params.event.as_str(),
                params.session_id
            ));
            return;
        };

        let delivery = PendingExecDelivery {
            event_id: event_id.clone(),
            session_key: pending.session_key.clone(),
            event: params.event,
            call_id: params.call_id.clone().or(Some(pending.call_id.clone())),
            exit_code: params.exit_code,
            signal: params.signal.clone(),
            output_tail: params.output_tail.clone(),
            attempts: 0,
            next_attempt_at: now,
            expires_at: now + Duration::hours(PENDING_TTL_HOURS),
        };
        if let Err(e) = self.deliveries.put(&event_id, delivery) {
            tracing::warn!(error = %e, event_id = %event_id, "failed to queue exec delivery");
            return;
        }
        let _ = self.sessions.remove(&pending_id);
        state.scheduler.reschedule();
    }

    /// Attempt every due delivery. Called from the alarm loop.
    pub async fn retry_due(&self, state: &GatewayState, now: DateTime<Utc>) {
        for (event_id, delivery) in self.deliveries.entries().unwrap_or_default() {
            if delivery.next_attempt_at > now {
                continue;
            }
            if delivery.expires_at <= now {
                let _ = self.deliveries.remove(&event_id);
                state
                    .logs
                    .push(format!("exec delivery {event_id} expired after {} attempts", delivery.attempts));
                continue;
            }

            match self.ingest_completion(state, &delivery).await {
                Ok(()) => {
                    let _ = self.delivered.put(&event_id, DeliveredEvent { at: now });
                    let _ = self.deliveries.remove(&event_id);
                }
                Err(e) => {
                    let attempts = delivery.attempts + 1;
                    let backoff = RETRY_BASE_SECS
                        .saturating_mul(1i64 << attempts.min(30))
                        .min(RETRY_CAP_SECS);
                    let _ = self.deliveries.patch(&event_id, |d| {
                        d.attempts = attempts;
                        d.next_attempt_at = now + Duration::seconds(backoff);
                    });
                    tracing::warn!(event_id = %event_id, attempts, error = %e, "exec delivery failed, backing off");
                }
            }
        }
    }

    /// Deliver one terminal event into its originating session.
    async fn ingest_completion(
        &self,
        state: &GatewayState,
        delivery: &PendingExecDelivery,
    ) -> sy_domain::Result<()> {
        let mut text = format!("[exec {}]", delivery.event.as_str());
        if let Some(exit_code) = delivery.exit_code {
            text.push_str(&format!(" exit={exit_code}"));
        }
        if let Some(signal) = &delivery.signal {
            text.push_str(&format!(" signal={signal}"));
        }
        if let Some(tail) = &delivery.output_tail {
            text.push_str("\n");
            text.push_str(tail);
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        state
            .sessions
            .chat_send(
                state,
                &delivery.session_key,
                text,
                run_id,
                Default::default(),
                Vec::new(),
                None,
            )
            .await?;
        Ok(())
    }

    /// Drop expired pendings and aged-out delivered markers.
    pub fn gc(&self, now: DateTime<Utc>) {
        for (id, session) in self.sessions.entries().unwrap_or_default() {
            if session.expires_at <= now {
                let _ = self.sessions.remove(&id);
            }
        }
        let cutoff = now - Duration::hours(DELIVERED_TTL_HOURS);
        for (id, marker) in self.delivered.entries().unwrap_or_default() {
            if marker.at < cutoff {
                let _ = self.delivered.remove(&id);
            }
        }
    }

    /// Earliest future instant this subsystem needs the alarm for.
    pub fn next_fire(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut next: Option<DateTime<Utc>> = None;
        let mut consider = |t: DateTime<Utc>| {
            next = Some(match next {
                Some(current) if current <= t => current,
                _ => t,
            });
        };
        for (_, session) in self.sessions.entries().unwrap_or_default() {
            consider(session.expires_at);
        }
        for (_, delivery) in self.deliveries.entries().unwrap_or_default() {
            consider(delivery.next_attempt_at);
            consider(delivery.expires_at);
        }
        for (_, marker) in self.delivered.entries().unwrap_or_default() {
            consider(marker.at + Duration::hours(DELIVERED_TTL_HOURS));
        }
        next
    }

    pub fn pending_session_count(&self) -> usize {
        self.sessions.len().unwrap_or(0)
    }

    pub fn queued_delivery_count(&self) -> usize {
        self.deliveries.len().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(event: ExecEventKind) -> ExecEventParams {
        ExecEventParams {
            session_id: "s1".into(),
            event,
            call_id: Some("c1".into()),
            exit_code: Some(0),
            signal: None,
            output_tail: Some("done".into()),
            started_at: None,
            ended_at: None,
            event_id: None,
        }
    }

    #[test]
    fn derived_event_id_is_stable_and_sensitive() {
        let a = derive_event_id("n1", &params(ExecEventKind::Finished));
        let b = derive_event_id("n1", &params(ExecEventKind::Finished));
        assert_eq!(a, b);

        let c = derive_event_id("n1", &params(ExecEventKind::Failed));
        assert_ne!(a, c);
        let d = derive_event_id("n2", &params(ExecEventKind::Finished));
        assert_ne!(a, d);
    }

    #[test]
    fn explicit_event_id_wins() {
        let mut p = params(ExecEventKind::Finished);
        p.event_id = Some("custom-1".into());
        assert_eq!(derive_event_id("n1", &p), "custom-1");
    }
}
