//! NodeHealthMonitor (spec §4.3).
//!
//! Derives `connectivityStatus` for every known node from the most recent
//! heartbeat, on a periodic sweep. Decoupled from `connection` through the
//! `ConnectionEvent` broadcast channel rather than a direct call, so C3
//! never has to reach back into C2's internals.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use sitekeeper_shared::wire::Heartbeat;

use crate::connection::{AgentConnectionManager, ConnectionEvent};
use crate::model::{AgentConnectivityStatus, CachedNodeState};

/// Emitted when a node's derived connectivity status changes on a sweep.
#[derive(Debug, Clone)]
pub struct NodeStatusChanged {
    pub node_name: String,
    pub previous: AgentConnectivityStatus,
    pub current: AgentConnectivityStatus,
}

#[derive(Debug)]
pub struct NodeHealthMonitor {
    states: DashMap<String, CachedNodeState>,
    heartbeat_interval: Duration,
    events: broadcast::Sender<NodeStatusChanged>,
}

impl NodeHealthMonitor {
    pub fn new(heartbeat_interval: Duration) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            states: DashMap::new(),
            heartbeat_interval,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeStatusChanged> {
        self.events.subscribe()
    }

    pub fn status_of(&self, node_name: &str) -> AgentConnectivityStatus {
        self.states
            .get(node_name)
            .map(|s| s.connectivity_status)
            .unwrap_or(AgentConnectivityStatus::NeverConnected)
    }

    pub fn snapshot(&self, node_name: &str) -> Option<CachedNodeState> {
        self.states.get(node_name).map(|s| s.clone())
    }

    fn entry(&self, node_name: &str) -> dashmap::mapref::one::RefMut<'_, String, CachedNodeState> {
        self.states
            .entry(node_name.to_string())
            .or_insert_with(|| CachedNodeState::new_never_connected(node_name))
    }

    pub fn record_connected(&self, node_name: &str) {
        let mut entry = self.entry(node_name);
        let previous = entry.connectivity_status;
        entry.connectivity_status = AgentConnectivityStatus::Online;
        entry.last_state_update_time = Utc::now();
        self.emit_if_changed(node_name, previous, entry.connectivity_status);
    }

    pub fn record_disconnected(&self, node_name: &str) {
        let mut entry = self.entry(node_name);
        let previous = entry.connectivity_status;
        entry.connectivity_status = AgentConnectivityStatus::Offline;
        entry.last_state_update_time = Utc::now();
        self.emit_if_changed(node_name, previous, entry.connectivity_status);
    }

    pub fn record_heartbeat(&self, hb: &Heartbeat) {
        let mut entry = self.entry(&hb.node_name);
        entry.last_heartbeat_time = Some(hb.timestamp);
        entry.cpu_usage_percent = hb.cpu_usage_percent;
        entry.ram_usage_percent = hb.ram_usage_percent;
        let previous = entry.connectivity_status;
        entry.connectivity_status = AgentConnectivityStatus::Online;
        entry.last_state_update_time = Utc::now();
        self.emit_if_changed(&hb.node_name, previous, entry.connectivity_status);
    }

    fn emit_if_changed(&self, node_name: &str, previous: AgentConnectivityStatus, current: AgentConnectivityStatus) {
        if previous != current {
            let _ = self.events.send(NodeStatusChanged {
                node_name: node_name.to_string(),
                previous,
                current,
            });
        }
    }

    /// Re-derive connectivity for every known node against `now` (§4.3's
    /// Online/Unreachable/Offline thresholds). Takes `now` explicitly so
    /// the rule can be unit-tested without a real clock driving it.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let online_until = self.heartbeat_interval.mul_f64(1.5);
        let unreachable_until = self.heartbeat_interval * 3;

        for mut entry in self.states.iter_mut() {
            let previous = entry.connectivity_status;
            if previous == AgentConnectivityStatus::NeverConnected {
                continue;
            }
            let next = match entry.last_heartbeat_time {
                None => AgentConnectivityStatus::NeverConnected,
                Some(last) => {
                    let age = (now - last).to_std().unwrap_or(Duration::ZERO);
                    if age <= online_until {
                        AgentConnectivityStatus::Online
                    } else if age <= unreachable_until {
                        AgentConnectivityStatus::Unreachable
                    } else {
                        AgentConnectivityStatus::Offline
                    }
                }
            };
            if next != previous {
                debug!(node_name = %entry.node_name, ?previous, ?next, "node connectivity changed");
                entry.connectivity_status = next;
                entry.last_state_update_time = now;
                let node_name = entry.node_name.clone();
                drop(entry);
                let _ = self.events.send(NodeStatusChanged { node_name, previous, current: next });
            }
        }
    }

    /// Background task: periodically sweep and, on disconnect, mark the
    /// node `Offline` immediately (an explicit disconnect needn't wait
    /// for the sweep's age-based rule).
    pub fn spawn_connection_listener(self: &Arc<Self>, connections: &Arc<AgentConnectionManager>) {
        let monitor = Arc::clone(self);
        let mut rx = connections.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    ConnectionEvent::AgentConnected(info) => monitor.record_connected(&info.node_name),
                    ConnectionEvent::AgentDisconnected { node_name } => monitor.record_disconnected(&node_name),
                    ConnectionEvent::HeartbeatReceived(hb) => monitor.record_heartbeat(&hb),
                }
            }
        });
    }

    pub fn spawn_periodic_sweep(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let interval = monitor.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.sweep(Utc::now());
            }
        });
    }
}
