//! Session key derivation.
//!
//! Key templates (normative):
//! - `agent:<agentId>:main`                                        (DM scope = main)
//! - `agent:<agentId>:<peerKind>:<peerId>`                         (DM scope = per-peer)
//! - `agent:<agentId>:<channel>:<peerKind>:<peerId>`               (DM scope = per-channel-peer)
//! - `agent:<agentId>:<channel>:<accountId>:<peerKind>:<peerId>`   (DM scope = per-account-channel-peer)
//!
//! Groups, channels, and threads always isolate with the full form; only
//! direct messages collapse per the configured scope. `<agentId>`,
//! `<channel>`, and `<peerKind>` are lowercased; ids are used verbatim after
//! normalization (identity links already applied by the caller).

use sy_domain::channel::{PeerKind, PeerRef};
use sy_domain::config::DmScope;

/// The designated main session key for an agent.
pub fn main_session_key(agent_id: &str, main_key: &str) -> String {
    format!("agent:{}:{}", agent_id.to_lowercase(), main_key)
}

/// The internal session key heartbeats run under.
pub fn heartbeat_session_key(agent_id: &str) -> String {
    format!("agent:{}:heartbeat:system:internal", agent_id.to_lowercase())
}

/// Derive the session key for an inbound peer. `peer_id` is the effective
/// id after identity-link resolution and sender normalization.
pub fn session_key_for_peer(
    agent_id: &str,
    channel: &str,
    account_id: &str,
    peer: &PeerRef,
    peer_id: &str,
    dm_scope: DmScope,
    main_key: &str,
) -> String {
    let agent = agent_id.to_lowercase();
    let channel = channel.to_lowercase();
    let kind = peer.kind.to_string();

    if peer.kind != PeerKind::Dm {
        return format!("agent:{agent}:{channel}:{account_id}:{kind}:{peer_id}");
    }

    match dm_scope {
        DmScope::Main => main_session_key(agent_id, main_key),
        DmScope::PerPeer => format!("agent:{agent}:{kind}:{peer_id}"),
        DmScope::PerChannelPeer => format!("agent:{agent}:{channel}:{kind}:{peer_id}"),
        DmScope::PerAccountChannelPeer => {
            format!("agent:{agent}:{channel}:{account_id}:{kind}:{peer_id}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm_peer(id: &str) -> PeerRef {
        PeerRef {
            kind: PeerKind::Dm,
            id: id.into(),
            name: None,
            handle: None,
            thread_id: None,
        }
    }

    #[test]
    fn dm_main_scope() {
        let peer = dm_peer("+33612345678");
        let key = session_key_for_peer(
            "Main",
            "WhatsApp",
            "acct1",
            &peer,
            &peer.id,
            DmScope::Main,
            "main",
        );
        assert_eq!(key, "agent:main:main");
    }

    #[test]
    fn dm_scopes_drop_fields() {
        let peer = dm_peer("u1");
        let per_peer = session_key_for_peer(
            "a", "discord", "acc", &peer, "u1", DmScope::PerPeer, "main",
        );
        assert_eq!(per_peer, "agent:a:dm:u1");

        let per_channel = session_key_for_peer(
            "a", "discord", "acc", &peer, "u1", DmScope::PerChannelPeer, "main",
        );
        assert_eq!(per_channel, "agent:a:discord:dm:u1");

        let full = session_key_for_peer(
            "a", "discord", "acc", &peer, "u1", DmScope::PerAccountChannelPeer, "main",
        );
        assert_eq!(full, "agent:a:discord:acc:dm:u1");
    }

    #[test]
    fn groups_always_use_full_form() {
        let peer = PeerRef {
            kind: PeerKind::Group,
            id: "g42".into(),
            name: None,
            handle: None,
            thread_id: None,
        };
        for scope in [DmScope::Main, DmScope::PerPeer, DmScope::PerAccountChannelPeer] {
            let key = session_key_for_peer("a", "Discord", "acc", &peer, "g42", scope, "main");
            assert_eq!(key, "agent:a:discord:acc:group:g42");
        }
    }

    #[test]
    fn segments_are_lowercased_but_ids_verbatim() {
        let peer = dm_peer("MixedCaseId");
        let key = session_key_for_peer(
            "MyAgent",
            "Telegram",
            "Acct",
            &peer,
            "MixedCaseId",
            DmScope::PerAccountChannelPeer,
            "main",
        );
        assert_eq!(key, "agent:myagent:telegram:Acct:dm:MixedCaseId");
    }

    #[test]
    fn heartbeat_key_shape() {
        assert_eq!(
            heartbeat_session_key("main"),
            "agent:main:heartbeat:system:internal"
        );
    }
}
