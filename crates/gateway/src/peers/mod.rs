//! Peer surface: registry, WebSocket socket loop, and method dispatch.

pub mod dispatch;
pub mod registry;
pub mod ws;

pub use registry::{NodeEntry, PeerHandle, PeerKey, PeerRegistry, PeerSink};
