//! GuiNotifier (spec §4.10): fan-out of MasterAction lifecycle events to
//! whatever live-UI transport sits above the core (a websocket hub, a
//! CLI's own polling loop, …). The core only depends on the trait.

use async_trait::async_trait;

use crate::model::{MasterAction, OverallStatus};

/// One lifecycle event for a single MasterAction. Ordering within one
/// MasterAction must be preserved by callers (§4.10); they arrive in
/// the order `started -> progress* -> completed`.
#[derive(Debug, Clone)]
pub enum MasterActionEvent {
    Started { master_action_id: String, operation_type: String },
    Progress { master_action_id: String, percent: u8, message: Option<String> },
    Completed { master_action_id: String, overall_status: OverallStatus, message: Option<String> },
}

/// Receives MasterAction lifecycle notifications (§4.10).
#[async_trait]
pub trait GuiNotifier: Send + Sync {
    async fn notify(&self, event: MasterActionEvent);
}

/// Default implementation: logs at debug level and otherwise drops the
/// event. Used wherever no live-UI transport is wired up (tests, and any
/// deployment that hasn't attached one yet).
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl GuiNotifier for NoopNotifier {
    async fn notify(&self, event: MasterActionEvent) {
        tracing::debug!(?event, "gui notification (no subscriber attached)");
    }
}

pub fn started_event(action: &MasterAction) -> MasterActionEvent {
    MasterActionEvent::Started {
        master_action_id: action.id.clone(),
        operation_type: action.operation_type.clone(),
    }
}

pub fn completed_event(action: &MasterAction) -> MasterActionEvent {
    MasterActionEvent::Completed {
        master_action_id: action.id.clone(),
        overall_status: action.overall_status,
        message: action.recent_logs.back().map(|entry| entry.message.clone()),
    }
}
