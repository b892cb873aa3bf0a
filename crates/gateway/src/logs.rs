//! Bounded in-memory log ring backing the `logs.get` RPC.
//!
//! The gateway pushes one line per event of record (tool timeout, eviction,
//! scheduler decision). `logs.get` reads the tail; with `wait=true` it
//! long-polls until a line newer than the cursor arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

const DEFAULT_CAPACITY: usize = 2_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub line: String,
}

pub struct LogRing {
    lines: Mutex<VecDeque<LogLine>>,
    next_seq: AtomicU64,
    notify: tokio::sync::Notify,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            next_seq: AtomicU64::new(1),
            notify: tokio::sync::Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(log_line = %line, "gateway log");
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            seq,
            at: Utc::now(),
            line,
        });
        drop(lines);
        self.notify.notify_waiters();
    }

    /// Lines with `seq > after`, oldest first.
    pub fn tail(&self, after: u64, limit: usize) -> Vec<LogLine> {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.seq > after)
            .take(limit)
            .cloned()
            .collect()
    }

    /// The newest sequence number handed out so far.
    pub fn head_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Long-poll: resolve as soon as a line newer than `after` exists.
    pub async fn wait_tail(&self, after: u64, limit: usize) -> Vec<LogLine> {
        loop {
            let notified = self.notify.notified();
            let lines = self.tail(after, limit);
            if !lines.is_empty() {
                return lines;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_respects_cursor_and_limit() {
        let ring = LogRing::new(10);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }
        let all = ring.tail(0, 100);
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].line, "line 0");

        let after = ring.tail(all[2].seq, 100);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].line, "line 3");

        assert_eq!(ring.tail(0, 2).len(), 2);
    }

    #[test]
    fn ring_is_bounded() {
        let ring = LogRing::new(3);
        for i in 0..10 {
            ring.push(format!("line {i}"));
        }
        let all = ring.tail(0, 100);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].line, "line 7");
        assert_eq!(ring.head_seq(), 10);
    }

    #[tokio::test]
    async fn wait_tail_wakes_on_push() {
        let ring = std::sync::Arc::new(LogRing::new(10));
        let waiter = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.wait_tail(0, 10).await })
        };
        tokio::task::yield_now().await;
        ring.push("hello");
        let lines = waiter.await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "hello");
    }
}
