//! Session model: key grammar, identity links, per-session state with reset
//! policies, registry entry types, and transcript archival.
//!
//! The session *actor* (mailbox + agent loop) lives in the gateway crate;
//! this crate is the plain data and the rules it obeys.

pub mod archive;
pub mod identity;
pub mod registry;
pub mod session_key;
pub mod state;

pub use archive::TranscriptArchiver;
pub use identity::{normalize_sender_id, IdentityResolver};
pub use registry::{ChannelRegistryEntry, LastActiveContext, SessionRegistryEntry};
pub use session_key::{heartbeat_session_key, main_session_key, session_key_for_peer};
pub use state::{ResetReason, SessionState};
