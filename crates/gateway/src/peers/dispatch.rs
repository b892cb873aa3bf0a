//! Frame dispatch: connect validation and per-frame routing.
//!
//! `connect` is the only method permitted before a socket is marked
//! connected; everything else answers error 101. Malformed frames are
//! logged and ignored; the socket stays open.

use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use sy_domain::tool::ToolDefinition;
use sy_domain::tool::NodeRuntime;
use sy_protocol::{ConnectParams, Frame, PeerMode, RpcError, PROTOCOL_VERSION};

use crate::peers::PeerKey;
use crate::rpc::{dispatch_method, Dispatch};
use crate::state::GatewayState;

/// Constant-time token comparison via SHA-256 digest. Hashing normalizes
/// lengths so `ct_eq` always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

#[derive(Debug)]
pub struct ConnectAccept {
    pub key: PeerKey,
    pub account_id: Option<String>,
    pub display_name: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub node_runtime: Option<NodeRuntime>,
}

/// Validate `connect` params against protocol version, auth token, and the
/// node-runtime requirement.
pub fn validate_connect(state: &GatewayState, params: Value) -> Result<ConnectAccept, RpcError> {
    let params: ConnectParams = serde_json::from_value(params)
        .map_err(|e| RpcError::validation(format!("invalid connect params: {e}")))?;

    if params.min_protocol > PROTOCOL_VERSION {
        return Err(RpcError::validation(format!(
            "peer requires protocol {} but gateway speaks {}",
            params.min_protocol, PROTOCOL_VERSION
        )));
    }
    if params.client.id.trim().is_empty() {
        return Err(RpcError::validation("client.id must not be empty"));
    }

    if let Some(expected) = &state.config.typed().auth.token {
        let provided = params.auth_token.as_deref().unwrap_or("");
        if !token_eq(provided, expected) {
            return Err(RpcError::new(
                sy_protocol::ERR_VALIDATION,
                "invalid or missing auth token",
            ));
        }
    }

    let node_runtime = match params.client.mode {
        PeerMode::Node => match params.node_runtime {
            Some(runtime) => Some(runtime),
            None => {
                return Err(RpcError::validation(
                    "Invalid nodeRuntime: mode=node requires a runtime descriptor",
                ));
            }
        },
        _ => None,
    };

    Ok(ConnectAccept {
        key: PeerKey::new(params.client.mode, params.client.id.clone()),
        account_id: params.client.account_id,
        display_name: params.client.display_name,
        tools: params.tools.unwrap_or_default(),
        node_runtime,
    })
}

/// Route one post-connect frame. Returns the `res` frame to write, if any.
pub async fn process_frame(state: &GatewayState, caller: &PeerKey, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::Req { id, method, params } => {
            if method == "connect" {
                // Idempotent no-op for an already-connected peer.
                return Some(Frame::ok(id, serde_json::json!({"ok": true})));
            }
            let result =
                dispatch_method(state, caller, &id, &method, params.unwrap_or(Value::Null)).await;
            match result {
                Ok(Dispatch::Reply(payload)) => Some(Frame::ok(id, payload)),
                Ok(Dispatch::Deferred) => None,
                Err(error) => Some(Frame::err(id, error)),
            }
        }
        Frame::Res { id, .. } => {
            // The gateway does not issue requests to peers over this
            // protocol; a stray response is logged and dropped.
            tracing::debug!(peer = %caller, frame_id = %id, "unsolicited res frame ignored");
            None
        }
        Frame::Evt { event, .. } => {
            tracing::debug!(peer = %caller, event = %event, "unhandled evt frame ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_is_exact() {
        assert!(token_eq("secret", "secret"));
        assert!(!token_eq("secret", "Secret"));
        assert!(!token_eq("secret", "secret "));
        assert!(!token_eq("", "secret"));
    }
}
