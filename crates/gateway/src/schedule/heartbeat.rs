//! Heartbeats — periodic agent self-prompts from `HEARTBEAT.md`.
//!
//! Each agent has an interval (`30m`, `1h`, `0m` = disabled) and optional
//! active hours. A due heartbeat runs in a dedicated internal session and
//! delivers to the configured target: `none` (silent), `last` (the agent's
//! last active conversation), or a named channel. `HEARTBEAT_OK` and short
//! acks are suppressed; identical text within 24h is deduplicated.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use sy_domain::config::ActiveHours;
use sy_domain::error::Result;
use sy_domain::trace::TraceEvent;
use sy_sessions::heartbeat_session_key;
use sy_store::{KvBackend, PersistedMap};

use crate::channels::PendingChannelResponse;
use crate::state::GatewayState;

/// Responses this short (after stripping) are acks, not content.
const MIN_MEANINGFUL_CHARS: usize = 3;

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatState {
    pub next_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat_text: Option<String>,
    pub last_heartbeat_sent_at: Option<DateTime<Utc>>,
}

pub struct HeartbeatStore {
    states: PersistedMap<HeartbeatState>,
}

impl HeartbeatStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            states: PersistedMap::new(kv, "heartbeat"),
        }
    }

    pub fn state_for(&self, agent_id: &str) -> HeartbeatState {
        self.states.get(agent_id).ok().flatten().unwrap_or_default()
    }

    pub fn put_state(&self, agent_id: &str, state: HeartbeatState) -> Result<()> {
        self.states.put(agent_id, state)
    }

    /// Ensure every configured agent has a next-fire time; returns the
    /// earliest across agents.
    pub fn next_fire(&self, state: &GatewayState) -> Option<DateTime<Utc>> {
        let config = state.config.typed();
        let now = Utc::now();
        let mut earliest: Option<DateTime<Utc>> = None;
        for agent in &config.agents.list {
            let hb = config.heartbeat_for(&agent.id);
            let Some(every) = parse_interval(&hb.every).filter(|d| !d.is_zero()) else {
                continue;
            };
            let mut hb_state = self.state_for(&agent.id);
            if hb_state.next_heartbeat_at.is_none() {
                hb_state.next_heartbeat_at = Some(now + every);
                let _ = self.put_state(&agent.id, hb_state.clone());
            }
            if let Some(at) = hb_state.next_heartbeat_at {
                earliest = Some(match earliest {
                    Some(current) if current <= at => current,
                    _ => at,
                });
            }
        }
        earliest
    }

    /// Run every agent whose heartbeat is due.
    pub async fn run_due(&self, state: &GatewayState, now: DateTime<Utc>) {
        let config = state.config.typed();
        for agent in &config.agents.list {
            let hb = config.heartbeat_for(&agent.id);
            let Some(every) = parse_interval(&hb.every).filter(|d| !d.is_zero()) else {
                continue;
            };
            let hb_state = self.state_for(&agent.id);
            let due = hb_state
                .next_heartbeat_at
                .map(|at| at <= now)
                .unwrap_or(false);
            if !due {
                continue;
            }
            // Reschedule first: a skipped or failed run must not re-fire in
            // a tight loop.
            let mut next = hb_state.clone();
            next.next_heartbeat_at = Some(now + every);
            let _ = self.put_state(&agent.id, next);

            if let Err(e) = self.run_for_agent(state, &agent.id, false).await {
                tracing::warn!(agent_id = %agent.id, error = %e, "heartbeat run failed");
            }
        }
    }

    /// Run one agent's heartbeat. `manual` (the `heartbeat.trigger` RPC)
    /// bypasses the HEARTBEAT.md gate and active hours.
    pub async fn run_for_agent(
        &self,
        state: &GatewayState,
        agent_id: &str,
        manual: bool,
    ) -> Result<serde_json::Value> {
        let config = state.config.typed();
        let hb = config.heartbeat_for(agent_id);
        let now = Utc::now();
        let user_tz = crate::runtime::session::resolve_tz(config.user_timezone.as_deref());

        if !manual {
            if let Some(hours) = &hb.active_hours {
                if !within_active_hours(hours, now, user_tz) {
                    TraceEvent::HeartbeatRun {
                        agent_id: agent_id.to_owned(),
                        delivered: false,
                    }
                    .emit();
                    return Ok(serde_json::json!({"skipped": "outside active hours"}));
                }
            }
        }

        let prompt = state
            .blob
            .get(&format!("agents/{agent_id}/HEARTBEAT.md"))?
            .map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        if prompt.trim().is_empty() && !manual {
            return Ok(serde_json::json!({"skipped": "HEARTBEAT.md missing or empty"}));
        }
        let prompt = if prompt.trim().is_empty() {
            "Heartbeat check-in. Reply HEARTBEAT_OK if nothing needs attention.".to_owned()
        } else {
            prompt
        };

        let session_key = heartbeat_session_key(agent_id);
        if state.sessions.is_processing(&session_key) {
            return Ok(serde_json::json!({"skipped": "heartbeat session busy"}));
        }

        let run_id = uuid::Uuid::new_v4().to_string();

        // Resolve the delivery target before the run so the reply router
        // can pick the response up by run id.
        let target = match hb.target.as_str() {
            "none" => None,
            "last" => state.last_active.get(agent_id).ok().flatten().map(|c| {
                (c.channel, c.account_id, c.peer)
            }),
            channel => {
                let channel = channel.to_owned();
                state
                    .last_active
                    .get(agent_id)
                    .ok()
                    .flatten()
                    .filter(|c| c.channel == channel)
                    .map(|c| (c.channel, c.account_id, c.peer))
            }
        };
        let has_target = target.is_some();
        if let Some((channel, account_id, peer)) = target {
            state.pending_responses.put(
                &run_id,
                PendingChannelResponse {
                    channel,
                    account_id,
                    peer,
                    inbound_message_id: format!("heartbeat:{agent_id}"),
                    agent_id: Some(agent_id.to_owned()),
                    is_heartbeat: true,
                    created_at: now,
                },
            )?;
        }

        state
            .sessions
            .chat_send(
                state,
                &session_key,
                prompt,
                run_id.clone(),
                Default::default(),
                Vec::new(),
                None,
            )
            .await?;

        let mut hb_state = self.state_for(agent_id);
        hb_state.last_heartbeat_at = Some(now);
        self.put_state(agent_id, hb_state)?;

        TraceEvent::HeartbeatRun {
            agent_id: agent_id.to_owned(),
            delivered: has_target,
        }
        .emit();
        Ok(serde_json::json!({"runId": run_id, "target": has_target}))
    }

    /// Strip `HEARTBEAT_OK`, drop short acks, and dedup identical text
    /// within 24h. Returns the text to deliver, if any.
    pub fn filter_response(&self, agent_id: &str, text: &str) -> Option<String> {
        let stripped = text
            .trim_end()
            .trim_end_matches(HEARTBEAT_OK)
            .trim()
            .to_owned();
        if stripped.len() < MIN_MEANINGFUL_CHARS {
            return None;
        }
        let now = Utc::now();
        let hb_state = self.state_for(agent_id);
        if let (Some(last_text), Some(sent_at)) =
            (&hb_state.last_heartbeat_text, hb_state.last_heartbeat_sent_at)
        {
            if *last_text == stripped && now.signed_duration_since(sent_at) < Duration::hours(24) {
                return None;
            }
        }
        let mut updated = hb_state;
        updated.last_heartbeat_text = Some(stripped.clone());
        updated.last_heartbeat_sent_at = Some(now);
        if let Err(e) = self.put_state(agent_id, updated) {
            tracing::warn!(agent_id, error = %e, "failed to persist heartbeat dedup state");
        }
        Some(stripped)
    }

    pub fn status(&self, state: &GatewayState) -> serde_json::Value {
        let config = state.config.typed();
        let agents: Vec<serde_json::Value> = config
            .agents
            .list
            .iter()
            .map(|agent| {
                let hb = config.heartbeat_for(&agent.id);
                let hb_state = self.state_for(&agent.id);
                serde_json::json!({
                    "agentId": agent.id,
                    "every": hb.every,
                    "target": hb.target,
                    "nextHeartbeatAt": hb_state.next_heartbeat_at,
                    "lastHeartbeatAt": hb_state.last_heartbeat_at,
                    "lastHeartbeatSentAt": hb_state.last_heartbeat_sent_at,
                })
            })
            .collect();
        serde_json::json!({"agents": agents})
    }
}

/// Parse `"30m"`, `"1h"`, `"45s"`, `"2d"`. `"0m"` parses to zero (disabled).
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.is_ascii() {
        return None;
    }
    let (number, unit) = raw.split_at(raw.len() - 1);
    let value: i64 = number.parse().ok()?;
    match unit {
        "s" => Some(Duration::seconds(value)),
        "m" => Some(Duration::minutes(value)),
        "h" => Some(Duration::hours(value)),
        "d" => Some(Duration::days(value)),
        _ => None,
    }
}

fn within_active_hours(hours: &ActiveHours, now: DateTime<Utc>, user_tz: chrono_tz::Tz) -> bool {
    let tz = if hours.tz == "user" {
        user_tz
    } else {
        crate::schedule::cron_expr::parse_tz(&hours.tz)
    };
    let local = now.with_timezone(&tz);
    let minutes = local.hour() * 60 + local.minute();
    let Some(start) = parse_hhmm(&hours.start) else {
        return true;
    };
    let Some(end) = parse_hhmm(&hours.end) else {
        return true;
    };
    if start <= end {
        minutes >= start && minutes < end
    } else {
        // Overnight window (e.g. 22:00..06:00).
        minutes >= start || minutes < end
    }
}

fn parse_hhmm(raw: &str) -> Option<u32> {
    let (h, m) = raw.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn intervals_parse() {
        assert_eq!(parse_interval("30m"), Some(Duration::minutes(30)));
        assert_eq!(parse_interval("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_interval("0m"), Some(Duration::zero()));
        assert_eq!(parse_interval("bogus"), None);
        assert_eq!(parse_interval(""), None);
    }

    #[test]
    fn active_hours_daytime_window() {
        let hours = ActiveHours {
            start: "09:00".into(),
            end: "18:00".into(),
            tz: "UTC".into(),
        };
        let noon = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 6, 15, 3, 0, 0).unwrap();
        assert!(within_active_hours(&hours, noon, chrono_tz::UTC));
        assert!(!within_active_hours(&hours, night, chrono_tz::UTC));
    }

    #[test]
    fn active_hours_overnight_window() {
        let hours = ActiveHours {
            start: "22:00".into(),
            end: "06:00".into(),
            tz: "UTC".into(),
        };
        let late = Utc.with_ymd_and_hms(2024, 6, 15, 23, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 6, 15, 5, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert!(within_active_hours(&hours, late, chrono_tz::UTC));
        assert!(within_active_hours(&hours, early, chrono_tz::UTC));
        assert!(!within_active_hours(&hours, noon, chrono_tz::UTC));
    }

    #[test]
    fn heartbeat_ok_is_stripped() {
        let store = HeartbeatStore::new(Arc::new(sy_store::MemoryKv::new()));
        assert_eq!(store.filter_response("a", "HEARTBEAT_OK"), None);
        assert_eq!(store.filter_response("a", "ok"), None);
        assert_eq!(
            store.filter_response("a", "Disk almost full.\nHEARTBEAT_OK"),
            Some("Disk almost full.".to_owned())
        );
    }

    #[test]
    fn repeated_text_dedups_for_24h() {
        let store = HeartbeatStore::new(Arc::new(sy_store::MemoryKv::new()));
        assert!(store.filter_response("a", "Disk almost full.").is_some());
        assert_eq!(store.filter_response("a", "Disk almost full."), None);
        // Different text still goes out.
        assert!(store.filter_response("a", "All clear now.").is_some());
        // Other agents are independent.
        assert!(store.filter_response("b", "All clear now.").is_some());
    }
}
