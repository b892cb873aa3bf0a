//! Gateway-owned registry entry types.
//!
//! These are index records: message bodies live in the session actor's own
//! state. The gateway persists them via the object store and is their sole
//! writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sy_domain::channel::PeerRef;

/// One row per known session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRegistryEntry {
    pub session_key: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One row per connected channel account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRegistryEntry {
    pub channel: String,
    pub account_id: String,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Where an agent last saw traffic — the default delivery target for
/// heartbeats and cron runs without an explicit address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastActiveContext {
    pub channel: String,
    pub account_id: String,
    pub peer: PeerRef,
    pub session_key: String,
    pub timestamp: DateTime<Utc>,
}
