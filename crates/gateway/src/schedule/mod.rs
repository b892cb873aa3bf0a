//! Unified scheduler.
//!
//! One alarm drives everything time-based: heartbeats, cron, probe timeouts
//! and GC, async-exec expiry and delivery retries, delivered-events GC, and
//! stale-peer pruning. Every operation that changes the due-set calls
//! [`SchedulerHandle::reschedule`]; the loop recomputes the minimum next
//! fire and sleeps until it.

pub mod cron;
pub mod cron_expr;
pub mod heartbeat;
pub mod probes;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::state::GatewayState;

/// Peers silent this long are evicted by the alarm loop.
const STALE_PEER_SECS: i64 = 15 * 60;

/// Upper bound on one sleep so config changes are picked up even without an
/// explicit reschedule.
const MAX_SLEEP_SECS: u64 = 5 * 60;

#[derive(Default)]
pub struct SchedulerHandle {
    notify: Notify,
}

impl SchedulerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the alarm loop to recompute its next fire time.
    pub fn reschedule(&self) {
        self.notify.notify_one();
    }
}

/// The minimum next-fire across all scheduled work, if any exists.
fn compute_next_fire(state: &GatewayState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let candidates = [
        state.heartbeats.next_fire(state),
        state.cron.next_fire(),
        state.probes.next_fire(state),
        state.exec.next_fire(now),
    ];
    candidates.into_iter().flatten().min()
}

async fn fire_due(state: &GatewayState, now: DateTime<Utc>) {
    state.heartbeats.run_due(state, now).await;
    state.cron.run_due(state, now).await;
    state.probes.tick(state, now).await;
    state.exec.retry_due(state, now).await;
    state.exec.gc(now);

    for key in state.peers.prune_stale(STALE_PEER_SECS) {
        if key.mode == sy_protocol::PeerMode::Node {
            state.tools.fail_pending_for_node(state, &key.id).await;
        }
    }
}

/// The alarm loop. Runs for the life of the gateway.
pub async fn run_alarm_loop(state: GatewayState) {
    loop {
        let now = Utc::now();
        let next = compute_next_fire(&state, now);
        let sleep_for = match next {
            Some(at) if at <= now => std::time::Duration::ZERO,
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                .min(std::time::Duration::from_secs(MAX_SLEEP_SECS)),
            // Nothing scheduled: the alarm is effectively cleared; only a
            // reschedule (or the safety bound) wakes us.
            None => std::time::Duration::from_secs(MAX_SLEEP_SECS),
        };

        tokio::select! {
            _ = state.scheduler.notify.notified() => continue,
            _ = tokio::time::sleep(sleep_for) => {}
        }

        fire_due(&state, Utc::now()).await;
    }
}
