//! Per-session persisted state and reset-policy evaluation.
//!
//! One `SessionState` lives under `session:{sessionKey}`. The owning actor
//! is its sole writer. Reset rotates the session id *after* pushing the old
//! id onto `previousSessionIds` — a crash between the two leaves a harmless
//! extra history entry, never a lost one.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sy_domain::config::{ResetMode, ResetPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Free-form per-session settings (model, thinkLevel, …), shallow-merged
    /// by `patch`.
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
    /// Per-session override; `None` falls back to the config default.
    #[serde(default)]
    pub reset_policy: Option<ResetPolicy>,
    #[serde(default)]
    pub last_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_session_ids: Vec<String>,
    /// How many compaction parts were archived for the current session id.
    #[serde(default)]
    pub archived_parts: u32,
    #[serde(default)]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why an automatic reset fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Daily,
    Idle,
    Manual,
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetReason::Daily => write!(f, "daily"),
            ResetReason::Idle => write!(f, "idle"),
            ResetReason::Manual => write!(f, "manual"),
        }
    }
}

impl SessionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            settings: serde_json::Map::new(),
            reset_policy: None,
            last_reset_at: None,
            previous_session_ids: Vec::new(),
            archived_parts: 0,
            label: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rotate the session id, clearing history and counters. Returns the
    /// old session id (the caller archives its transcript first).
    pub fn reset(&mut self, now: DateTime<Utc>) -> String {
        let old_id = self.session_id.clone();
        self.previous_session_ids.push(old_id.clone());
        self.session_id = uuid::Uuid::new_v4().to_string();
        self.messages.clear();
        self.input_tokens = 0;
        self.output_tokens = 0;
        self.archived_parts = 0;
        self.last_reset_at = Some(now);
        self.updated_at = now;
        old_id
    }

    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
    }

    /// Evaluate the effective reset policy against the last activity time.
    /// `tz` is the user timezone for the daily boundary.
    pub fn should_auto_reset(
        &self,
        default_policy: &ResetPolicy,
        now: DateTime<Utc>,
        tz: chrono_tz::Tz,
    ) -> Option<ResetReason> {
        let policy = self.reset_policy.as_ref().unwrap_or(default_policy);
        match policy.mode {
            ResetMode::Manual => None,
            ResetMode::Daily => {
                let boundary = daily_boundary(now, policy.at_hour, tz);
                (self.updated_at < boundary).then_some(ResetReason::Daily)
            }
            ResetMode::Idle => {
                let idle = now.signed_duration_since(self.updated_at);
                (idle > Duration::milliseconds(policy.idle_minutes as i64 * 60_000))
                    .then_some(ResetReason::Idle)
            }
        }
    }
}

/// The most recent local `at_hour` boundary at or before `now`.
fn daily_boundary(now: DateTime<Utc>, at_hour: u32, tz: chrono_tz::Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let date = local.date_naive();
    let Some(today) = date.and_hms_opt(at_hour.min(23), 0, 0) else {
        return now;
    };
    let candidate = match tz.from_local_datetime(&today) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // DST gap: treat the boundary as now so nothing resets spuriously.
        chrono::LocalResult::None => now,
    };
    if candidate <= now {
        return candidate;
    }
    // Boundary hasn't passed yet today; use yesterday's.
    let Some(yesterday) = date
        .pred_opt()
        .and_then(|d| d.and_hms_opt(at_hour.min(23), 0, 0))
    else {
        return candidate - Duration::days(1);
    };
    match tz.from_local_datetime(&yesterday) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => candidate - Duration::days(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_domain::config::ResetPolicy;

    fn policy(mode: ResetMode, idle_minutes: u64) -> ResetPolicy {
        ResetPolicy {
            mode,
            at_hour: 4,
            idle_minutes,
        }
    }

    #[test]
    fn reset_rotates_and_keeps_history() {
        let now = Utc::now();
        let mut state = SessionState::new(now);
        let first = state.session_id.clone();
        state.messages.push(serde_json::json!({"role": "user"}));
        state.record_usage(10, 20);

        let old = state.reset(now);
        assert_eq!(old, first);
        assert_ne!(state.session_id, first);
        assert_eq!(state.previous_session_ids, vec![first]);
        assert!(state.messages.is_empty());
        assert_eq!(state.input_tokens, 0);
        assert_eq!(state.output_tokens, 0);
    }

    #[test]
    fn history_length_counts_resets() {
        let now = Utc::now();
        let mut state = SessionState::new(now);
        for _ in 0..3 {
            state.reset(now);
        }
        assert_eq!(state.previous_session_ids.len(), 3);
    }

    #[test]
    fn manual_never_auto_resets() {
        let now = Utc::now();
        let mut state = SessionState::new(now - Duration::days(30));
        state.updated_at = now - Duration::days(30);
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Manual, 0), now, chrono_tz::UTC),
            None
        );
    }

    #[test]
    fn idle_zero_minutes_resets_every_call() {
        let now = Utc::now();
        let mut state = SessionState::new(now - Duration::milliseconds(20));
        state.updated_at = now - Duration::milliseconds(20);
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Idle, 0), now, chrono_tz::UTC),
            Some(ResetReason::Idle)
        );
    }

    #[test]
    fn idle_respects_window() {
        let now = Utc::now();
        let mut state = SessionState::new(now);
        state.updated_at = now - Duration::minutes(5);
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Idle, 10), now, chrono_tz::UTC),
            None
        );
        state.updated_at = now - Duration::minutes(11);
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Idle, 10), now, chrono_tz::UTC),
            Some(ResetReason::Idle)
        );
    }

    #[test]
    fn daily_resets_across_the_boundary() {
        let tz = chrono_tz::UTC;
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let mut state = SessionState::new(now);

        // Last touched yesterday evening: 04:00 boundary has passed since.
        state.updated_at = Utc.with_ymd_and_hms(2024, 6, 14, 22, 0, 0).unwrap();
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Daily, 0), now, tz),
            Some(ResetReason::Daily)
        );

        // Touched this morning after the boundary: no reset.
        state.updated_at = Utc.with_ymd_and_hms(2024, 6, 15, 5, 0, 0).unwrap();
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Daily, 0), now, tz),
            None
        );
    }

    #[test]
    fn per_session_policy_overrides_default() {
        let now = Utc::now();
        let mut state = SessionState::new(now);
        state.updated_at = now - Duration::minutes(2);
        state.reset_policy = Some(policy(ResetMode::Idle, 1));
        // Default says manual; the session override wins.
        assert_eq!(
            state.should_auto_reset(&policy(ResetMode::Manual, 0), now, chrono_tz::UTC),
            Some(ResetReason::Idle)
        );
    }
}
