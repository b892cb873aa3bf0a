//! Cron jobs: one-shot, interval, and cron-expression schedules.
//!
//! `systemEvent` jobs run in the agent's main session; `task` jobs run in an
//! isolated per-job session so the agent has no main-history bleed. When
//! delivery is wired, the run is registered in `pendingChannelResponses` and
//! the reply router carries the final text to the resolved target.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sy_domain::channel::PeerRef;
use sy_domain::error::{Error, Result};
use sy_domain::trace::TraceEvent;
use sy_protocol::RpcError;
use sy_sessions::LastActiveContext;
use sy_store::{KvBackend, PersistedMap};

use crate::channels::PendingChannelResponse;
use crate::schedule::cron_expr::{parse_tz, CronExpr};
use crate::state::GatewayState;
use crate::tools::router::CallRoute;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    /// One-shot at an absolute instant.
    At {
        #[serde(rename = "atMs")]
        at_ms: i64,
    },
    /// Fixed interval, anchored to `anchorMs` (or creation time).
    Every {
        #[serde(rename = "everyMs")]
        every_ms: i64,
        #[serde(default, rename = "anchorMs", skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// 5-field cron expression evaluated in `tz`.
    Cron { expr: String, tz: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum CronSpec {
    /// Runs in the agent's main session; `text` becomes the user message.
    SystemEvent {
        text: String,
        #[serde(default)]
        deliver: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerRef>,
    },
    /// Runs in an isolated session key.
    Task {
        message: String,
        #[serde(default = "d_true")]
        deliver: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerRef>,
    },
}

fn d_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobState {
    pub next_run_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub running_since: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    pub schedule: CronSchedule,
    pub spec: CronSpec,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub session_key: String,
    pub delivered: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CronStore {
    jobs: PersistedMap<CronJob>,
    runs: PersistedMap<Vec<CronRunRecord>>,
}

impl CronStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            jobs: PersistedMap::new(kv.clone(), "cron"),
            runs: PersistedMap::new(kv, "cronruns"),
        }
    }

    pub fn list(&self) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = self
            .jobs
            .entries()
            .unwrap_or_default()
            .into_iter()
            .map(|(_, job)| job)
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.get(id).ok().flatten()
    }

    pub fn add(&self, state: &GatewayState, params: Value) -> Result<CronJob> {
        let config = state.config.typed();
        if !config.cron.enabled {
            return Err(Error::Validation("cron is disabled".into()));
        }
        if self.jobs.len().unwrap_or(0) >= config.cron.max_jobs {
            return Err(Error::Validation(format!(
                "job limit reached ({} max)",
                config.cron.max_jobs
            )));
        }

        let schedule: CronSchedule = serde_json::from_value(params["schedule"].clone())
            .map_err(|e| Error::Validation(format!("invalid schedule: {e}")))?;
        if let CronSchedule::Cron { expr, .. } = &schedule {
            CronExpr::parse(expr).map_err(|e| {
                Error::Validation(format!("invalid cron expression '{expr}': {e}"))
            })?;
        }
        if let CronSchedule::Every { every_ms, .. } = &schedule {
            if *every_ms <= 0 {
                return Err(Error::Validation("everyMs must be positive".into()));
            }
        }
        let spec: CronSpec = serde_json::from_value(params["spec"].clone())
            .map_err(|e| Error::Validation(format!("invalid spec: {e}")))?;

        let now = Utc::now();
        let mut job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: params["name"].as_str().unwrap_or("unnamed").to_owned(),
            agent_id: params["agentId"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| config.default_agent_id()),
            schedule,
            spec,
            enabled: params["enabled"].as_bool().unwrap_or(true),
            delete_after_run: params["deleteAfterRun"].as_bool().unwrap_or(false),
            state: CronJobState::default(),
            created_at: now,
        };
        job.state.next_run_at_ms = compute_next_run(&job, now).map(|t| t.timestamp_millis());
        self.jobs.put(&job.id, job.clone())?;
        state.scheduler.reschedule();
        Ok(job)
    }

    pub fn update(&self, state: &GatewayState, id: &str, params: Value) -> Result<CronJob> {
        let found = self.jobs.patch(id, |job| {
            if let Some(name) = params["name"].as_str() {
                job.name = name.to_owned();
            }
            if let Some(enabled) = params["enabled"].as_bool() {
                job.enabled = enabled;
            }
            if let Some(delete_after_run) = params["deleteAfterRun"].as_bool() {
                job.delete_after_run = delete_after_run;
            }
            if !params["schedule"].is_null() {
                if let Ok(schedule) = serde_json::from_value(params["schedule"].clone()) {
                    job.schedule = schedule;
                }
            }
            if !params["spec"].is_null() {
                if let Ok(spec) = serde_json::from_value(params["spec"].clone()) {
                    job.spec = spec;
                }
            }
            job.state.next_run_at_ms =
                compute_next_run(job, Utc::now()).map(|t| t.timestamp_millis());
        })?;
        if !found {
            return Err(Error::NotFound(format!("cron job {id}")));
        }
        state.scheduler.reschedule();
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("cron job {id}")))
    }

    pub fn remove(&self, state: &GatewayState, id: &str) -> Result<bool> {
        let existed = self.get(id).is_some();
        self.jobs.remove(id)?;
        self.runs.remove(id)?;
        state.scheduler.reschedule();
        Ok(existed)
    }

    pub fn runs(&self, id: &str) -> Vec<CronRunRecord> {
        self.runs.get(id).ok().flatten().unwrap_or_default()
    }

    /// Jobs whose stored next-run time has passed.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<CronJob> {
        self.list()
            .into_iter()
            .filter(|job| job.enabled)
            .filter(|job| {
                job.state
                    .next_run_at_ms
                    .map(|ms| ms <= now.timestamp_millis())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.list()
            .into_iter()
            .filter(|job| job.enabled)
            .filter_map(|job| job.state.next_run_at_ms)
            .min()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Execute one job now. `force` ignores the schedule.
    pub async fn run_job(&self, state: &GatewayState, id: &str, force: bool) -> Result<Value> {
        let job = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("cron job {id}")))?;
        if !force {
            let due = job
                .state
                .next_run_at_ms
                .map(|ms| ms <= Utc::now().timestamp_millis())
                .unwrap_or(false);
            if !due {
                return Err(Error::Validation("job is not due".into()));
            }
        }
        let run_id = self.execute(state, &job).await?;
        Ok(json!({"runId": run_id, "jobId": job.id}))
    }

    /// Dispatch one run of a job into its session and advance the schedule.
    pub async fn execute(&self, state: &GatewayState, job: &CronJob) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let config = state.config.typed();
        let tz = match &job.schedule {
            CronSchedule::Cron { tz, .. } => parse_tz(tz),
            _ => crate::runtime::session::resolve_tz(config.user_timezone.as_deref()),
        };
        let local_time = now.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string();

        let agent = job.agent_id.to_lowercase();
        let (session_key, message, deliver, channel, to) = match &job.spec {
            CronSpec::SystemEvent {
                text,
                deliver,
                channel,
                to,
            } => (
                sy_sessions::main_session_key(&agent, &config.session.main_key),
                text.clone(),
                *deliver,
                channel.clone(),
                to.clone(),
            ),
            CronSpec::Task {
                message,
                deliver,
                channel,
                to,
            } => (
                format!("agent:{agent}:cron:{}", job.id),
                message.clone(),
                *deliver,
                channel.clone(),
                to.clone(),
            ),
        };

        let mut text = format!("[cron · {local_time}] {message}");

        let mut delivered = false;
        if deliver {
            match resolve_delivery_target(state, &agent, channel, to) {
                Some((channel, account_id, peer)) => {
                    let pending = PendingChannelResponse {
                        channel: channel.clone(),
                        account_id: account_id.clone(),
                        peer: peer.clone(),
                        inbound_message_id: format!("cron:{}", job.id),
                        agent_id: Some(agent.clone()),
                        is_heartbeat: false,
                        created_at: now,
                    };
                    state.pending_responses.put(&run_id, pending)?;
                    // Isolated sessions still need a default target for the
                    // message tool.
                    if matches!(job.spec, CronSpec::Task { .. }) {
                        let _ = state.last_active.put(
                            &agent,
                            LastActiveContext {
                                channel,
                                account_id,
                                peer,
                                session_key: session_key.clone(),
                                timestamp: now,
                            },
                        );
                    }
                    text.push_str(
                        "\n(Your reply is delivered automatically; do not call the message tool for it.)",
                    );
                    delivered = true;
                }
                None => {
                    state.logs.push(format!(
                        "cron job {} has deliver=true but no resolvable target",
                        job.id
                    ));
                }
            }
        }

        state
            .sessions
            .chat_send(
                state,
                &session_key,
                text,
                run_id.clone(),
                Default::default(),
                Vec::new(),
                None,
            )
            .await?;

        TraceEvent::CronFired {
            job_id: job.id.clone(),
            mode: match job.spec {
                CronSpec::SystemEvent { .. } => "systemEvent".into(),
                CronSpec::Task { .. } => "task".into(),
            },
        }
        .emit();

        // Record the run, bounded by config history.
        let max_history = config.cron.max_runs_per_job_history;
        let mut history = self.runs(&job.id);
        history.push(CronRunRecord {
            run_id: run_id.clone(),
            started_at: now,
            session_key,
            delivered,
        });
        if history.len() > max_history {
            let excess = history.len() - max_history;
            history.drain(..excess);
        }
        self.runs.put(&job.id, history)?;

        // Advance or retire the schedule.
        let one_shot = matches!(job.schedule, CronSchedule::At { .. });
        if job.delete_after_run {
            self.jobs.remove(&job.id)?;
            self.runs.remove(&job.id)?;
        } else {
            self.jobs.patch(&job.id, |j| {
                j.state.last_run_at_ms = Some(now.timestamp_millis());
                j.state.running_since = None;
                j.state.next_run_at_ms = if one_shot {
                    j.enabled = false;
                    None
                } else {
                    compute_next_run(j, now).map(|t| t.timestamp_millis())
                };
            })?;
        }
        state.scheduler.reschedule();
        Ok(run_id)
    }

    /// Run every due job, bounded by `maxConcurrentRuns` per tick.
    pub async fn run_due(&self, state: &GatewayState, now: DateTime<Utc>) {
        let config = state.config.typed();
        if !config.cron.enabled {
            return;
        }
        for job in self
            .due_jobs(now)
            .into_iter()
            .take(config.cron.max_concurrent_runs)
        {
            if let Err(e) = self.execute(state, &job).await {
                tracing::warn!(job_id = %job.id, error = %e, "cron execution failed");
                // Push the schedule forward so a broken job cannot spin.
                let _ = self.jobs.patch(&job.id, |j| {
                    j.state.next_run_at_ms =
                        compute_next_run(j, now).map(|t| t.timestamp_millis());
                });
            }
        }
    }
}

/// Next run instant for a job, strictly after `now` for recurring kinds.
pub fn compute_next_run(job: &CronJob, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &job.schedule {
        CronSchedule::At { at_ms } => {
            if job.state.last_run_at_ms.is_some() {
                None
            } else {
                Utc.timestamp_millis_opt(*at_ms).single()
            }
        }
        CronSchedule::Every { every_ms, anchor_ms } => {
            let anchor = anchor_ms.unwrap_or(job.created_at.timestamp_millis());
            let now_ms = now.timestamp_millis();
            let next_ms = if now_ms <= anchor {
                anchor
            } else {
                let elapsed = now_ms - anchor;
                let periods = elapsed / every_ms + 1;
                anchor + periods * every_ms
            };
            Utc.timestamp_millis_opt(next_ms).single()
        }
        CronSchedule::Cron { expr, tz } => CronExpr::parse(expr)
            .ok()
            .and_then(|cron| cron.next_after(&now, parse_tz(tz))),
    }
}

fn resolve_delivery_target(
    state: &GatewayState,
    agent_id: &str,
    channel: Option<String>,
    to: Option<PeerRef>,
) -> Option<(String, String, PeerRef)> {
    if let (Some(channel), Some(peer)) = (channel.clone(), to) {
        let account_id = state
            .channel_index
            .entries()
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, e)| e.channel == channel)
            .max_by_key(|(_, e)| e.last_message_at.unwrap_or(e.connected_at))
            .map(|(_, e)| e.account_id)?;
        return Some((channel, account_id, peer));
    }
    let context = state.last_active.get(agent_id).ok().flatten()?;
    Some((context.channel, context.account_id, context.peer))
}

/// The `cron` native tool: an action-dispatched façade over the store.
pub async fn handle_cron_tool(
    state: &GatewayState,
    args: Value,
    _route: &CallRoute,
) -> std::result::Result<Value, RpcError> {
    let action = args["action"]
        .as_str()
        .ok_or_else(|| RpcError::validation("action is required"))?;
    match action {
        "list" => Ok(json!({"jobs": state.cron.list()})),
        "status" => {
            let jobs = state.cron.list();
            Ok(json!({
                "enabled": state.config.typed().cron.enabled,
                "jobs": jobs.len(),
                "nextRunAtMs": state.cron.next_fire().map(|t| t.timestamp_millis()),
            }))
        }
        "add" => {
            let job = state
                .cron
                .add(state, args["job"].clone())
                .map_err(rpc_from_domain)?;
            Ok(json!({"job": job}))
        }
        "remove" => {
            let id = args["id"]
                .as_str()
                .ok_or_else(|| RpcError::validation("id is required"))?;
            let removed = state.cron.remove(state, id).map_err(rpc_from_domain)?;
            Ok(json!({"removed": removed}))
        }
        "run" => {
            let id = args["id"]
                .as_str()
                .ok_or_else(|| RpcError::validation("id is required"))?;
            let force = args["mode"].as_str() == Some("force");
            state
                .cron
                .run_job(state, id, force)
                .await
                .map_err(rpc_from_domain)
        }
        "runs" => {
            let id = args["id"]
                .as_str()
                .ok_or_else(|| RpcError::validation("id is required"))?;
            Ok(json!({"runs": state.cron.runs(id)}))
        }
        other => Err(RpcError::validation(format!("unknown cron action {other}"))),
    }
}

pub fn rpc_from_domain(error: Error) -> RpcError {
    match &error {
        Error::Validation(message) => RpcError::validation(message.clone()),
        Error::NotFound(message) => RpcError::not_found(message.clone()),
        Error::Timeout(message) => RpcError {
            retryable: Some(true),
            ..RpcError::new(sy_protocol::ERR_UNAVAILABLE, message.clone())
        },
        _ => RpcError::internal(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(schedule: CronSchedule) -> CronJob {
        CronJob {
            id: "j1".into(),
            name: "test".into(),
            agent_id: "main".into(),
            schedule,
            spec: CronSpec::Task {
                message: "do it".into(),
                deliver: true,
                channel: None,
                to: None,
            },
            enabled: true,
            delete_after_run: false,
            state: CronJobState::default(),
            created_at: Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn at_is_one_shot() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let past = now.timestamp_millis() - 1_000;
        let mut j = job(CronSchedule::At { at_ms: past });
        // Due immediately even though the instant has passed.
        assert_eq!(
            compute_next_run(&j, now).map(|t| t.timestamp_millis()),
            Some(past)
        );
        // Once run, never again.
        j.state.last_run_at_ms = Some(now.timestamp_millis());
        assert_eq!(compute_next_run(&j, now), None);
    }

    #[test]
    fn every_advances_on_anchor_grid() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 0, 25, 0).unwrap();
        let anchor = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let j = job(CronSchedule::Every {
            every_ms: 600_000, // 10 min
            anchor_ms: Some(anchor.timestamp_millis()),
        });
        let next = compute_next_run(&j, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 15, 0, 30, 0).unwrap());
    }

    #[test]
    fn cron_kind_uses_expression() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let j = job(CronSchedule::Cron {
            expr: "0 * * * *".into(),
            tz: "UTC".into(),
        });
        let next = compute_next_run(&j, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn schedule_serde_matches_wire_shape() {
        let schedule: CronSchedule =
            serde_json::from_value(json!({"kind": "at", "atMs": 123})).unwrap();
        assert_eq!(schedule, CronSchedule::At { at_ms: 123 });

        let spec: CronSpec = serde_json::from_value(json!({
            "mode": "task", "message": "reply TASK_CRON_DELIVERED"
        }))
        .unwrap();
        match spec {
            CronSpec::Task { deliver, .. } => assert!(deliver, "task delivery defaults on"),
            _ => panic!("expected task spec"),
        }
    }
}
