//! Pairing gate — holds first-contact DMs until an operator approves.
//!
//! Under `dmPolicy=pairing` an unknown sender's first message creates one
//! pairing record (idempotent on the normalized sender id) and gets an
//! "awaiting approval" reply. Approval moves the id onto the channel's
//! `allowFrom` list; denial just drops the record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sy_domain::error::Result;
use sy_domain::trace::TraceEvent;
use sy_sessions::normalize_sender_id;
use sy_store::{KvBackend, PersistedMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    pub channel: String,
    /// Normalized (E.164 for phone-like ids).
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
}

pub struct PairingStore {
    records: PersistedMap<PairingRecord>,
}

fn record_id(channel: &str, sender_id: &str) -> String {
    format!("{channel}:{sender_id}")
}

impl PairingStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            records: PersistedMap::new(kv, "pair"),
        }
    }

    /// Record a pairing request. Returns `true` when this is the sender's
    /// first message (a reply should be sent); repeats are no-ops.
    pub fn hold(
        &self,
        channel: &str,
        raw_sender_id: &str,
        sender_name: Option<String>,
        first_message: Option<String>,
    ) -> Result<bool> {
        let sender_id = normalize_sender_id(raw_sender_id);
        let id = record_id(channel, &sender_id);
        if self.records.get(&id)?.is_some() {
            return Ok(false);
        }
        self.records.put(
            &id,
            PairingRecord {
                channel: channel.to_owned(),
                sender_id: sender_id.clone(),
                sender_name,
                requested_at: Utc::now(),
                first_message,
            },
        )?;
        TraceEvent::PairingHeld {
            channel: channel.to_owned(),
            sender_id,
        }
        .emit();
        Ok(true)
    }

    pub fn list(&self) -> Vec<PairingRecord> {
        let mut records: Vec<PairingRecord> = self
            .records
            .entries()
            .unwrap_or_default()
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        records.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        records
    }

    /// Remove the record; returns it so the caller can update `allowFrom`.
    pub fn take(&self, channel: &str, raw_sender_id: &str) -> Result<Option<PairingRecord>> {
        let sender_id = normalize_sender_id(raw_sender_id);
        let id = record_id(channel, &sender_id);
        let record = self.records.get(&id)?;
        if record.is_some() {
            self.records.remove(&id)?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_store::MemoryKv;

    fn store() -> PairingStore {
        PairingStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn first_message_holds_repeats_do_not() {
        let pairing = store();
        assert!(pairing
            .hold("whatsapp", "+33 6 12 34 56 78", None, Some("hi".into()))
            .unwrap());
        // Differently formatted id: same normalized sender, no new record.
        assert!(!pairing
            .hold("whatsapp", "33612345678", None, Some("hello?".into()))
            .unwrap());
        assert_eq!(pairing.list().len(), 1);
        assert_eq!(pairing.list()[0].sender_id, "+33612345678");
        assert_eq!(pairing.list()[0].first_message.as_deref(), Some("hi"));
    }

    #[test]
    fn take_removes_record() {
        let pairing = store();
        pairing.hold("whatsapp", "+33612345678", None, None).unwrap();
        let record = pairing.take("whatsapp", "+33612345678").unwrap().unwrap();
        assert_eq!(record.channel, "whatsapp");
        assert!(pairing.list().is_empty());
        assert!(pairing.take("whatsapp", "+33612345678").unwrap().is_none());
    }

    #[test]
    fn channels_are_isolated() {
        let pairing = store();
        pairing.hold("whatsapp", "+33612345678", None, None).unwrap();
        assert!(pairing.hold("telegram", "+33612345678", None, None).unwrap());
        assert_eq!(pairing.list().len(), 2);
    }
}
