//! Shared gateway state passed to every handler and background task.
//!
//! Fields are grouped by concern:
//! - **Storage** — KV backend, blob store, config store
//! - **Peers & tools** — peer registry, tool router, async-exec tracker
//! - **Sessions** — actor manager, registries, last-active contexts
//! - **Channels** — pairing, pending responses, dedupe, adapters, media
//! - **Scheduling** — cron, heartbeats, probes, the alarm handle
//! - **Plumbing** — LLM providers, skills, logs, chat event bus

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use sy_llm::ProviderRegistry;
use sy_protocol::ChatEventPayload;
use sy_sessions::{ChannelRegistryEntry, LastActiveContext, SessionRegistryEntry};
use sy_skills::SkillsRegistry;
use sy_store::{BlobStore, KvBackend, MemoryBlobStore, MemoryKv, PersistedMap};

use sy_domain::error::Result;

use crate::channels::{ChannelAdapter, DedupeStore, PendingChannelResponse};
use crate::config_store::ConfigStore;
use crate::logs::LogRing;
use crate::peers::PeerRegistry;
use crate::runtime::SessionManager;
use crate::schedule::cron::CronStore;
use crate::schedule::heartbeat::HeartbeatStore;
use crate::schedule::probes::ProbeStore;
use crate::schedule::SchedulerHandle;
use crate::tools::exec::ExecTracker;
use crate::tools::ToolRouter;

const DEDUPE_TTL_SECS: u64 = 10 * 60;

#[derive(Clone)]
pub struct GatewayState {
    // ── Storage ───────────────────────────────────────────────────
    pub kv: Arc<dyn KvBackend>,
    pub blob: Arc<dyn BlobStore>,
    pub config: Arc<ConfigStore>,

    // ── Peers & tools ─────────────────────────────────────────────
    pub peers: Arc<PeerRegistry>,
    pub tools: Arc<ToolRouter>,
    pub exec: Arc<ExecTracker>,

    // ── Sessions ──────────────────────────────────────────────────
    pub sessions: Arc<SessionManager>,
    pub session_index: Arc<PersistedMap<SessionRegistryEntry>>,
    pub channel_index: Arc<PersistedMap<ChannelRegistryEntry>>,
    pub last_active: Arc<PersistedMap<LastActiveContext>>,

    // ── Channels ──────────────────────────────────────────────────
    pub pairing: Arc<crate::channels::pairing::PairingStore>,
    pub pending_responses: Arc<PersistedMap<PendingChannelResponse>>,
    pub media_index: Arc<PersistedMap<String>>,
    pub dedupe: Arc<DedupeStore>,
    pub adapters: Arc<RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>>,

    // ── Scheduling ────────────────────────────────────────────────
    pub cron: Arc<CronStore>,
    pub heartbeats: Arc<HeartbeatStore>,
    pub probes: Arc<ProbeStore>,
    pub scheduler: Arc<SchedulerHandle>,

    // ── Plumbing ──────────────────────────────────────────────────
    pub llm: Arc<ProviderRegistry>,
    pub skills: Arc<SkillsRegistry>,
    pub logs: Arc<LogRing>,
    pub chat_tx: broadcast::Sender<ChatEventPayload>,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(kv: Arc<dyn KvBackend>, blob: Arc<dyn BlobStore>) -> Result<Self> {
        let config = Arc::new(ConfigStore::load(kv.clone())?);
        let llm_timeout = config.typed().timeouts.llm_ms;
        let (chat_tx, _) = broadcast::channel(256);

        Ok(Self {
            peers: Arc::new(PeerRegistry::new(kv.clone())),
            tools: Arc::new(ToolRouter::new()),
            exec: Arc::new(ExecTracker::new(kv.clone())),
            sessions: Arc::new(SessionManager::new()),
            session_index: Arc::new(PersistedMap::new(kv.clone(), "sessidx")),
            channel_index: Arc::new(PersistedMap::new(kv.clone(), "chanidx")),
            last_active: Arc::new(PersistedMap::new(kv.clone(), "lastactive")),
            pairing: Arc::new(crate::channels::pairing::PairingStore::new(kv.clone())),
            pending_responses: Arc::new(PersistedMap::new(kv.clone(), "pendingresp")),
            media_index: Arc::new(PersistedMap::new(kv.clone(), "mediaidx")),
            dedupe: Arc::new(DedupeStore::new(std::time::Duration::from_secs(
                DEDUPE_TTL_SECS,
            ))),
            adapters: Arc::new(RwLock::new(HashMap::new())),
            cron: Arc::new(CronStore::new(kv.clone())),
            heartbeats: Arc::new(HeartbeatStore::new(kv.clone())),
            probes: Arc::new(ProbeStore::new(kv.clone())),
            scheduler: Arc::new(SchedulerHandle::new()),
            llm: Arc::new(ProviderRegistry::new(llm_timeout)),
            skills: Arc::new(SkillsRegistry::new(blob.clone())),
            logs: Arc::new(LogRing::default()),
            chat_tx,
            config,
            kv,
            blob,
            started_at: Utc::now(),
        })
    }

    /// Fully in-memory state for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        Self::new(kv, blob).unwrap_or_else(|e| {
            // MemoryKv cannot fail to load; keep the invariant visible.
            panic!("in-memory state construction failed: {e}")
        })
    }

    /// Start the long-lived background tasks: reply router and alarm loop.
    /// The router's subscription is taken here, synchronously, so no chat
    /// event emitted after this call can be missed.
    pub fn spawn_background(&self) {
        let chat_rx = self.chat_tx.subscribe();
        tokio::spawn(crate::channels::replies::run_reply_router(
            self.clone(),
            chat_rx,
        ));
        tokio::spawn(crate::schedule::run_alarm_loop(self.clone()));
    }

    /// Register an in-process channel adapter (service-binding RPC analog).
    pub fn register_adapter(&self, channel: &str, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.write().insert(channel.to_owned(), adapter);
    }
}
