//! AgentConnectionManager (spec §4.2).
//!
//! One entry per `node_name`, keyed and locked through a `DashMap` so
//! concurrent calls for different nodes never block each other while
//! calls for the *same* node are naturally serialized through the
//! map's per-shard locking — the same sharded-concurrency idiom the
//! teacher uses for its in-memory provider registries.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use sitekeeper_shared::wire::Heartbeat;

use crate::model::{AgentConnectivityStatus, ConnectedAgentInfo};

/// Published on every connect/disconnect/heartbeat so `health` can derive
/// connectivity without this module depending on it directly.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    AgentConnected(ConnectedAgentInfo),
    AgentDisconnected { node_name: String },
    HeartbeatReceived(Heartbeat),
}

#[derive(Debug)]
pub struct AgentConnectionManager {
    agents: DashMap<String, ConnectedAgentInfo>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl AgentConnectionManager {
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            agents: DashMap::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Unique by `node_name`; a prior entry with a different
    /// `channel_handle` is replaced (the old channel is presumed closed
    /// by the caller — this manager only tracks bookkeeping).
    pub fn on_agent_connected(
        &self,
        channel_handle: impl Into<String>,
        node_name: impl Into<String>,
        max_concurrent_tasks: u32,
        remote_address: Option<String>,
    ) -> ConnectedAgentInfo {
        let node_name = node_name.into();
        let mut info = ConnectedAgentInfo::new(node_name.clone(), channel_handle, max_concurrent_tasks);
        info.remote_address = remote_address;

        if let Some(prior) = self.agents.get(&node_name) {
            if prior.channel_handle != info.channel_handle {
                info!(node_name = %node_name, old_channel = %prior.channel_handle, new_channel = %info.channel_handle, "replacing stale agent connection");
            }
        }
        self.agents.insert(node_name.clone(), info.clone());
        let _ = self.events.send(ConnectionEvent::AgentConnected(info.clone()));
        info
    }

    /// Removes only if `channel_handle` still matches, guarding against a
    /// race with a newer connection replacing this entry first (§4.2).
    pub fn on_agent_disconnected(&self, channel_handle: &str, node_name: Option<&str>) {
        let target = match node_name {
            Some(n) => n.to_string(),
            None => match self.agents.iter().find(|e| e.channel_handle == channel_handle) {
                Some(e) => e.key().clone(),
                None => return,
            },
        };

        let removed = self
            .agents
            .remove_if(&target, |_, info| info.channel_handle == channel_handle)
            .is_some();

        if removed {
            let _ = self.events.send(ConnectionEvent::AgentDisconnected { node_name: target });
        } else {
            warn!(node_name = %target, channel_handle, "disconnect ignored: channel_handle no longer matches current entry");
        }
    }

    pub fn process_heartbeat(&self, hb: Heartbeat) {
        if let Some(mut info) = self.agents.get_mut(&hb.node_name) {
            info.last_heartbeat_time = hb.timestamp;
            info.last_known_status = AgentConnectivityStatus::Online;
        }
        let _ = self.events.send(ConnectionEvent::HeartbeatReceived(hb));
    }

    pub fn get_all_connected_agents(&self) -> Vec<ConnectedAgentInfo> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_agent(&self, node_name: &str) -> Option<ConnectedAgentInfo> {
        self.agents.get(node_name).map(|e| e.value().clone())
    }

    pub fn is_connected(&self, node_name: &str) -> bool {
        self.agents.contains_key(node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_a_node_makes_it_visible() {
        let mgr = AgentConnectionManager::new();
        let info = mgr.on_agent_connected("chan-1", "n1", 4, Some("10.0.0.1:9000".to_string()));
        assert_eq!(info.node_name, "n1");
        assert!(mgr.is_connected("n1"));
        assert_eq!(mgr.get_all_connected_agents().len(), 1);
    }

    #[test]
    fn reconnect_replaces_prior_entry_for_same_node() {
        let mgr = AgentConnectionManager::new();
        mgr.on_agent_connected("chan-1", "n1", 4, None);
        mgr.on_agent_connected("chan-2", "n1", 4, None);
        let info = mgr.get_agent("n1").unwrap();
        assert_eq!(info.channel_handle, "chan-2");
        assert_eq!(mgr.get_all_connected_agents().len(), 1);
    }

    #[test]
    fn disconnect_with_stale_channel_handle_is_ignored() {
        let mgr = AgentConnectionManager::new();
        mgr.on_agent_connected("chan-1", "n1", 4, None);
        mgr.on_agent_connected("chan-2", "n1", 4, None); // reconnect, new handle
        mgr.on_agent_disconnected("chan-1", Some("n1")); // stale disconnect for old handle
        assert!(mgr.is_connected("n1"));
    }

    #[test]
    fn disconnect_with_current_channel_handle_removes_entry() {
        let mgr = AgentConnectionManager::new();
        mgr.on_agent_connected("chan-1", "n1", 4, None);
        mgr.on_agent_disconnected("chan-1", Some("n1"));
        assert!(!mgr.is_connected("n1"));
    }

    #[test]
    fn process_heartbeat_updates_last_heartbeat_time() {
        let mgr = AgentConnectionManager::new();
        mgr.on_agent_connected("chan-1", "n1", 4, None);
        let ts = Utc::now();
        mgr.process_heartbeat(Heartbeat {
            node_name: "n1".to_string(),
            timestamp: ts,
            active_tasks: 0,
            available_task_slots: 4,
            cpu_usage_percent: None,
            ram_usage_percent: None,
        });
        assert_eq!(mgr.get_agent("n1").unwrap().last_heartbeat_time, ts);
    }
}
