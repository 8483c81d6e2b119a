//! Connected-agent bookkeeping (spec §3 `ConnectedAgentInfo`, `CachedNodeState`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connectivity classification derived by the health monitor (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentConnectivityStatus {
    NeverConnected,
    Online,
    Unreachable,
    Offline,
    Unknown,
}

impl Default for AgentConnectivityStatus {
    fn default() -> Self {
        Self::NeverConnected
    }
}

/// A live transport-level connection tracked by `AgentConnectionManager` (§4.2).
///
/// `channel_handle` is an opaque identifier used only to tell one physical
/// connection from the next for the same `node_name` (e.g. after a
/// reconnect); it carries no transport semantics at this layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAgentInfo {
    pub node_name: String,
    pub channel_handle: String,
    pub agent_version: Option<String>,
    pub os_description: Option<String>,
    pub framework_description: Option<String>,
    pub max_concurrent_tasks: u32,
    pub remote_address: Option<String>,
    pub connected_since: DateTime<Utc>,
    pub last_heartbeat_time: DateTime<Utc>,
    pub last_known_status: AgentConnectivityStatus,
    pub metadata: Value,
}

impl ConnectedAgentInfo {
    pub fn new(node_name: impl Into<String>, channel_handle: impl Into<String>, max_concurrent_tasks: u32) -> Self {
        let now = Utc::now();
        Self {
            node_name: node_name.into(),
            channel_handle: channel_handle.into(),
            agent_version: None,
            os_description: None,
            framework_description: None,
            max_concurrent_tasks,
            remote_address: None,
            connected_since: now,
            last_heartbeat_time: now,
            last_known_status: AgentConnectivityStatus::Online,
            metadata: Value::Null,
        }
    }
}

/// Most recently reported point-in-time state for a node (§3 `CachedNodeState`),
/// independent of whether the node is currently connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedNodeState {
    pub node_name: String,
    pub connectivity_status: AgentConnectivityStatus,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub cpu_usage_percent: Option<f32>,
    pub ram_usage_percent: Option<f32>,
    pub last_diagnostics_artifact: Option<Value>,
    pub installed_packages: Option<Value>,
    pub application_statuses: Option<Value>,
    pub last_state_update_time: DateTime<Utc>,
}

impl CachedNodeState {
    pub fn new_never_connected(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            connectivity_status: AgentConnectivityStatus::NeverConnected,
            last_heartbeat_time: None,
            cpu_usage_percent: None,
            ram_usage_percent: None,
            last_diagnostics_artifact: None,
            installed_packages: None,
            application_statuses: None,
            last_state_update_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connected_agent_defaults_to_online() {
        let info = ConnectedAgentInfo::new("node-a", "chan-1", 4);
        assert_eq!(info.last_known_status, AgentConnectivityStatus::Online);
        assert_eq!(info.max_concurrent_tasks, 4);
    }

    #[test]
    fn never_connected_cached_state_has_no_heartbeat() {
        let state = CachedNodeState::new_never_connected("node-b");
        assert_eq!(state.connectivity_status, AgentConnectivityStatus::NeverConnected);
        assert!(state.last_heartbeat_time.is_none());
    }
}
