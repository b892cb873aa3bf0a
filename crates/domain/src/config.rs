//! Gateway configuration tree.
//!
//! This is the *default* layer: every field has a serde default so a missing
//! override document always merges cleanly. The config store in the gateway
//! crate layers a persisted override tree on top and serves dotted-path
//! reads/writes over the merged JSON.
//!
//! Field names serialize in camelCase — the wire paths clients use
//! (`apiKeys.anthropic`, `channels.whatsapp.dmPolicy`, …) address this tree
//! directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub model: ModelConfig,
    pub api_keys: ApiKeys,
    pub timeouts: Timeouts,
    pub auth: AuthConfig,
    pub transcription: TranscriptionConfig,
    /// Per-channel settings, keyed by channel name (`whatsapp`, `discord`, …).
    pub channels: HashMap<String, ChannelConfig>,
    pub session: SessionConfig,
    pub skills: SkillsConfig,
    pub agents: AgentsConfig,
    pub cron: CronConfig,
    /// IANA timezone used when active hours or reset hours say `"user"`.
    pub user_timezone: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model & API keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default = "d_provider")]
    pub provider: ModelProvider,
    #[serde(default = "d_model_id")]
    pub id: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: d_provider(),
            id: d_model_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Anthropic,
    Openai,
    Google,
    Openrouter,
}

fn d_provider() -> ModelProvider {
    ModelProvider::Anthropic
}

fn d_model_id() -> String {
    "claude-sonnet-4-20250514".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub google: Option<String>,
    pub openrouter: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeouts & auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Wall-clock budget for one LLM call.
    #[serde(default = "d_llm_ms")]
    pub llm_ms: u64,
    /// Deadline for a dispatched tool call before the session fails it.
    #[serde(default = "d_tool_ms")]
    pub tool_ms: u64,
    /// Age after which an unanswered skill probe is garbage-collected.
    #[serde(default = "d_probe_max_age_ms")]
    pub skill_probe_max_age_ms: u64,
}

fn d_llm_ms() -> u64 {
    120_000
}

fn d_tool_ms() -> u64 {
    60_000
}

fn d_probe_max_age_ms() -> u64 {
    600_000
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            llm_ms: d_llm_ms(),
            tool_ms: d_tool_ms(),
            skill_probe_max_age_ms: d_probe_max_age_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Pre-shared token required at `connect` when set.
    pub token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionConfig {
    pub provider: TranscriptionProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TranscriptionProvider {
    #[default]
    #[serde(rename = "workers-ai")]
    WorkersAi,
    #[serde(rename = "openai")]
    Openai,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub dm_policy: DmPolicy,
    /// Normalized sender ids admitted under `allowlist` / `pairing`.
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    #[default]
    Open,
    Allowlist,
    Pairing,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub default_reset_policy: ResetPolicy,
    /// Suffix of the designated main session key (`agent:{id}:{mainKey}`).
    #[serde(default = "d_main_key")]
    pub main_key: String,
    #[serde(default)]
    pub dm_scope: DmScope,
    /// Folds multiple channel identities into one canonical name.
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,
}

fn d_main_key() -> String {
    "main".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_reset_policy: ResetPolicy::default(),
            main_key: d_main_key(),
            dm_scope: DmScope::default(),
            identity_links: Vec::new(),
        }
    }
}

/// When a session auto-resets, evaluated at the top of every `chatSend`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPolicy {
    #[serde(default)]
    pub mode: ResetMode,
    /// Local hour for `daily` resets.
    #[serde(default = "d_reset_hour")]
    pub at_hour: u32,
    /// Idle window for `idle` resets. `0` resets on every call.
    #[serde(default)]
    pub idle_minutes: u64,
}

fn d_reset_hour() -> u32 {
    4
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            mode: ResetMode::Manual,
            at_hour: d_reset_hour(),
            idle_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    #[default]
    Manual,
    Daily,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DmScope {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "per-peer")]
    PerPeer,
    #[serde(rename = "per-channel-peer")]
    PerChannelPeer,
    #[default]
    #[serde(rename = "per-account-channel-peer")]
    PerAccountChannelPeer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityLink {
    /// Canonical identity key used in session keys.
    pub canonical: String,
    /// Raw peer ids (`telegram:123`, `whatsapp:+3361…`) folded into it.
    pub peer_ids: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillsConfig {
    /// Per-skill overrides keyed by skill name.
    pub entries: HashMap<String, SkillOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillOverride {
    pub enabled: Option<bool>,
    /// Force-include the skill regardless of eligibility.
    pub always: Option<bool>,
    pub requires: Option<SkillRequires>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillRequires {
    /// Host binaries the skill depends on.
    pub bins: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default = "d_agent_list")]
    pub list: Vec<AgentEntry>,
    /// First matching binding wins; unmatched inbounds go to the default agent.
    #[serde(default)]
    pub bindings: Vec<AgentBinding>,
    #[serde(default)]
    pub default_heartbeat: HeartbeatConfig,
}

fn d_agent_list() -> Vec<AgentEntry> {
    vec![AgentEntry {
        id: "main".to_string(),
        default: true,
        heartbeat: None,
    }]
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            list: d_agent_list(),
            bindings: Vec::new(),
            default_heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub default: bool,
    /// Per-agent heartbeat override; falls back to `defaultHeartbeat`.
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentBinding {
    pub agent_id: String,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub peer_kind: Option<String>,
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Interval such as `"30m"`, `"1h"`; `"0m"` disables.
    #[serde(default = "d_heartbeat_every")]
    pub every: String,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    /// `"none"`, `"last"`, or a channel name.
    #[serde(default = "d_heartbeat_target")]
    pub target: String,
}

fn d_heartbeat_every() -> String {
    "0m".to_string()
}

fn d_heartbeat_target() -> String {
    "last".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            every: d_heartbeat_every(),
            active_hours: None,
            target: d_heartbeat_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveHours {
    /// `"HH:MM"` local start.
    pub start: String,
    /// `"HH:MM"` local end.
    pub end: String,
    /// IANA timezone, or `"user"` for `userTimezone`.
    #[serde(default = "d_tz_user")]
    pub tz: String,
}

fn d_tz_user() -> String {
    "user".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "d_max_runs_history")]
    pub max_runs_per_job_history: usize,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_runs: usize,
}

fn d_true() -> bool {
    true
}

fn d_max_jobs() -> usize {
    50
}

fn d_max_runs_history() -> usize {
    20
}

fn d_max_concurrent() -> usize {
    3
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_jobs: d_max_jobs(),
            max_runs_per_job_history: d_max_runs_history(),
            max_concurrent_runs: d_max_concurrent(),
        }
    }
}

impl GatewayConfig {
    /// The configured default agent id (first `default: true`, else first).
    pub fn default_agent_id(&self) -> String {
        self.agents
            .list
            .iter()
            .find(|a| a.default)
            .or_else(|| self.agents.list.first())
            .map(|a| a.id.clone())
            .unwrap_or_else(|| "main".to_string())
    }

    /// Effective heartbeat config for an agent.
    pub fn heartbeat_for(&self, agent_id: &str) -> HeartbeatConfig {
        self.agents
            .list
            .iter()
            .find(|a| a.id == agent_id)
            .and_then(|a| a.heartbeat.clone())
            .unwrap_or_else(|| self.agents.default_heartbeat.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = GatewayConfig::default();
        assert_eq!(config.timeouts.tool_ms, 60_000);
        assert_eq!(config.session.main_key, "main");
        assert_eq!(config.session.dm_scope, DmScope::PerAccountChannelPeer);
        assert_eq!(config.default_agent_id(), "main");
        assert!(config.cron.enabled);
    }

    #[test]
    fn empty_override_deserializes() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.timeouts.skill_probe_max_age_ms, 600_000);
        assert_eq!(config.agents.list.len(), 1);
    }

    #[test]
    fn camel_case_paths_on_the_wire() {
        let json = serde_json::to_value(GatewayConfig::default()).unwrap();
        assert!(json.get("apiKeys").is_some());
        assert!(json.get("userTimezone").is_some());
        assert!(json["timeouts"].get("llmMs").is_some());
        assert!(json["session"].get("dmScope").is_some());
    }

    #[test]
    fn dm_policy_parses_from_channel_section() {
        let json = serde_json::json!({
            "channels": { "whatsapp": { "dmPolicy": "pairing", "allowFrom": ["+33612345678"] } }
        });
        let config: GatewayConfig = serde_json::from_value(json).unwrap();
        let ch = &config.channels["whatsapp"];
        assert_eq!(ch.dm_policy, DmPolicy::Pairing);
        assert_eq!(ch.allow_from, vec!["+33612345678"]);
    }

    #[test]
    fn reset_policy_idle_zero_minutes() {
        let policy: ResetPolicy =
            serde_json::from_value(serde_json::json!({"mode": "idle", "idleMinutes": 0})).unwrap();
        assert_eq!(policy.mode, ResetMode::Idle);
        assert_eq!(policy.idle_minutes, 0);
    }

    #[test]
    fn heartbeat_falls_back_to_default() {
        let mut config = GatewayConfig::default();
        config.agents.default_heartbeat.every = "30m".to_string();
        assert_eq!(config.heartbeat_for("main").every, "30m");
        assert_eq!(config.heartbeat_for("unknown").every, "30m");
    }
}
