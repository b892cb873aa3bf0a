//! Tool and node-runtime descriptors.
//!
//! Nodes advertise a tool list plus a runtime descriptor at connect. Tools
//! are exposed to sessions and clients under the wire name
//! `{nodeId}__{toolName}`; the double underscore never appears inside a tool
//! name itself.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between node id and tool name in the advertised wire name.
pub const TOOL_NS_SEPARATOR: &str = "__";

/// Compose the client-visible wire name for a node tool.
pub fn namespaced_tool(node_id: &str, tool: &str) -> String {
    format!("{node_id}{TOOL_NS_SEPARATOR}{tool}")
}

/// Split a wire name at the first `__`. Returns `None` when there is no
/// separator or either side is empty.
pub fn split_namespaced_tool(wire_name: &str) -> Option<(&str, &str)> {
    let (node, tool) = wire_name.split_once(TOOL_NS_SEPARATOR)?;
    if node.is_empty() || tool.is_empty() {
        return None;
    }
    Some((node, tool))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities & runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "filesystem.list")]
    FilesystemList,
    #[serde(rename = "filesystem.read")]
    FilesystemRead,
    #[serde(rename = "filesystem.write")]
    FilesystemWrite,
    #[serde(rename = "filesystem.edit")]
    FilesystemEdit,
    #[serde(rename = "text.search")]
    TextSearch,
    #[serde(rename = "shell.exec")]
    ShellExec,
}

pub type CapSet = BTreeSet<Capability>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Execution,
    Specialized,
}

/// What a node can do on its host. Required at connect for `mode=node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRuntime {
    pub host_role: HostRole,
    #[serde(default)]
    pub host_capabilities: CapSet,
    /// Per-tool capability requirements, keyed by bare tool name.
    #[serde(default)]
    pub tool_capabilities: BTreeMap<String, CapSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_env: Option<String>,
    /// Binary availability as last probed, keyed by binary name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_bin_status: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_bin_status_updated_at: Option<DateTime<Utc>>,
}

impl NodeRuntime {
    pub fn can_exec(&self) -> bool {
        self.host_capabilities.contains(&Capability::ShellExec)
    }
}
