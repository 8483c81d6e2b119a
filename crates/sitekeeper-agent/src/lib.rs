//! Minimal slave-side harness (spec §1, §4.1).
//!
//! SiteKeeper treats task bodies as opaque, per-`TaskType` business logic
//! external to the core; this crate does not execute them. What it
//! provides is the connection-lifecycle skeleton a real slave needs on
//! top of that: registration, heartbeat cadence, and the reconnect
//! backoff policy — enough to drive `sitekeeper-core`'s in-memory
//! transport in tests and demos.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use sitekeeper_shared::wire::{Heartbeat, SlaveRegistration};

pub use sitekeeper_shared::wire as wire_types;

/// Static identity and capacity a slave advertises on connect.
#[derive(Debug, Clone)]
pub struct SlaveAgentConfig {
    pub node_name: String,
    pub agent_version: Option<String>,
    pub os_description: Option<String>,
    pub max_concurrent_tasks: u32,
    pub heartbeat_interval: Duration,
}

/// A slave's connection-side state: how it introduces itself and what it
/// reports on its heartbeat cadence. Task dispatch/execution is handled
/// by whatever embeds this harness, not by the harness itself.
#[derive(Debug)]
pub struct SlaveAgent {
    config: SlaveAgentConfig,
    active_tasks: AtomicU32,
}

impl SlaveAgent {
    pub fn new(config: SlaveAgentConfig) -> Self {
        Self { config, active_tasks: AtomicU32::new(0) }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    /// `SlaveRegistration` sent once, immediately after the transport
    /// connects (§4.1).
    pub fn registration(&self) -> SlaveRegistration {
        SlaveRegistration {
            agent_name: self.config.node_name.clone(),
            agent_version: self.config.agent_version.clone(),
            os_description: self.config.os_description.clone(),
            framework_description: Some("sitekeeper-agent".to_string()),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            hostname: None,
        }
    }

    /// One `Heartbeat` sample (§4.1, §4.3) reflecting the slave's current
    /// load. Embedders call `task_started`/`task_finished` as they accept
    /// and complete work so this stays accurate.
    pub fn heartbeat(&self) -> Heartbeat {
        let active = self.active_tasks.load(Ordering::SeqCst);
        Heartbeat {
            node_name: self.config.node_name.clone(),
            timestamp: Utc::now(),
            active_tasks: active,
            available_task_slots: self.config.max_concurrent_tasks.saturating_sub(active),
            cpu_usage_percent: None,
            ram_usage_percent: None,
        }
    }

    pub fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_finished(&self) {
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Spawns a loop that invokes `on_heartbeat` every `heartbeat_interval`
    /// with a fresh sample, mirroring the core's own periodic-sweep
    /// pattern (`NodeHealthMonitor::spawn_periodic_sweep`) rather than a
    /// bespoke `std::thread` + `sleep` loop.
    pub fn spawn_heartbeat_loop<F>(self: &std::sync::Arc<Self>, mut on_heartbeat: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Heartbeat) + Send + 'static,
    {
        let agent = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agent.heartbeat_interval());
            loop {
                ticker.tick().await;
                let hb = agent.heartbeat();
                debug!(node_name = %hb.node_name, active_tasks = hb.active_tasks, "sending heartbeat");
                on_heartbeat(hb);
            }
        })
    }
}
