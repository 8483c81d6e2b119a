//! ActionIdTranslator (spec §4.5).
//!
//! Bidirectional-enough map from `nodeActionId` to the owning
//! `masterActionId`, consulted on every inbound slave message. Entries
//! survive a grace period after unregistration so a message that arrives
//! just after the owning MasterAction finalized is still journaled
//! instead of silently dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;

/// Where an inbound `nodeActionId` routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResolution {
    /// Still live: route to the in-memory dispatcher context.
    Live { master_action_id: String, stage_index: usize },
    /// Unregistered but within the grace window: journal only.
    GraceWindow { master_action_id: String, stage_index: usize },
    /// Unknown, or unregistered past its grace window: drop with a warning.
    Unknown,
}

#[derive(Debug, Clone)]
struct Mapping {
    master_action_id: String,
    stage_index: usize,
    unregistered_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ActionIdTranslator {
    grace_period: Duration,
    entries: DashMap<String, Mapping>,
}

impl ActionIdTranslator {
    pub fn new(grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            grace_period,
            entries: DashMap::new(),
        })
    }

    /// Called when a NodeAction is created inside a stage (§4.5).
    pub fn register_mapping(&self, node_action_id: impl Into<String>, master_action_id: impl Into<String>, stage_index: usize) {
        self.entries.insert(
            node_action_id.into(),
            Mapping { master_action_id: master_action_id.into(), stage_index, unregistered_at: None },
        );
    }

    /// Called when the owning MasterAction is finalized. The entry is not
    /// removed immediately; it starts its grace window instead.
    pub fn unregister_mapping(&self, node_action_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(node_action_id) {
            entry.unregistered_at = Some(Utc::now());
        }
    }

    pub fn resolve(&self, node_action_id: &str) -> RouteResolution {
        let resolution = match self.entries.get(node_action_id) {
            None => RouteResolution::Unknown,
            Some(entry) => match entry.unregistered_at {
                None => RouteResolution::Live { master_action_id: entry.master_action_id.clone(), stage_index: entry.stage_index },
                Some(at) => {
                    let age = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
                    if age <= self.grace_period {
                        RouteResolution::GraceWindow { master_action_id: entry.master_action_id.clone(), stage_index: entry.stage_index }
                    } else {
                        RouteResolution::Unknown
                    }
                }
            },
        };
        if resolution == RouteResolution::Unknown {
            warn!(node_action_id, "no route for inbound slave message; dropping");
        }
        resolution
    }

    /// Drops entries whose grace window has fully elapsed. Intended to be
    /// called periodically so the map doesn't grow unbounded.
    pub fn sweep_expired(&self) {
        let grace_period = self.grace_period;
        self.entries.retain(|_, entry| match entry.unregistered_at {
            None => true,
            Some(at) => (Utc::now() - at).to_std().unwrap_or(Duration::ZERO) <= grace_period,
        });
    }

    /// Background task mirroring `NodeHealthMonitor::spawn_periodic_sweep`:
    /// keeps the map from growing unbounded once C5 is actually consulted
    /// on the live inbound-message path.
    pub fn spawn_periodic_sweep(self: &Arc<Self>) {
        let translator = Arc::clone(self);
        let period = translator.grace_period.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                translator.sweep_expired();
            }
        });
    }
}
