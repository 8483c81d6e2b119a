//! `NodeAction` (spec §3, §4.6): a group of per-node tasks of one
//! `TaskType` issued together, and the C6 output type it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node_task::NodeTaskStatus;

/// `NodeAction.overallStatus` (spec §3) — covers both the transient,
/// in-flight states and the terminal outcomes C6 computes (§4.6 "Overall
/// outcome computation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeActionOverallStatus {
    PendingInitiation,
    AwaitingReadiness,
    InProgress,
    Succeeded,
    SucceededWithErrors,
    Failed,
    Cancelled,
}

impl NodeActionOverallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededWithErrors | Self::Failed | Self::Cancelled)
    }
}

/// A set of `NodeTask`s dispatched together for one `TaskType` (§3 `NodeAction`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAction {
    pub id: String,
    pub name: Option<String>,
    pub task_type: String,
    pub stage_index: usize,
    pub overall_status: NodeActionOverallStatus,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque mapping carried for audit purposes only; never read for logic (§3).
    pub audit_context: Value,
    pub initiated_by: Option<String>,
    pub node_tasks: Vec<NodeTaskStatus>,
    pub progress_percent: u8,
    pub status_message: Option<String>,
    pub final_outcome: Option<NodeActionOverallStatus>,
    pub is_cancellation_requested: bool,
    pub result_payload: Option<Value>,
}

impl NodeAction {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, stage_index: usize, node_tasks: Vec<NodeTaskStatus>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: Some(name.into()),
            task_type: task_type.into(),
            stage_index,
            overall_status: NodeActionOverallStatus::PendingInitiation,
            creation_time: Utc::now(),
            start_time: None,
            end_time: None,
            audit_context: Value::Null,
            initiated_by: None,
            node_tasks,
            progress_percent: 0,
            status_message: None,
            final_outcome: None,
            is_cancellation_requested: false,
            result_payload: None,
        }
    }

    pub fn all_tasks_terminal(&self) -> bool {
        !self.node_tasks.is_empty() && self.node_tasks.iter().all(|t| t.state.is_terminal())
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }
}

/// Output of `NodeActionDispatcher::execute` (§4.6 "Outputs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeActionResult {
    pub is_success: bool,
    pub final_state: NodeAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_node_action_starts_non_terminal() {
        let task = NodeTaskStatus::new("na-1", "n1", "VerifyConfiguration", json!({}));
        let na = NodeAction::new("Verification", "VerifyConfiguration", 0, vec![task]);
        assert!(!na.all_tasks_terminal());
        assert_eq!(na.overall_status, NodeActionOverallStatus::PendingInitiation);
        assert!(na.final_outcome.is_none());
    }

    #[test]
    fn node_action_tasks_are_terminal_once_all_tasks_are() {
        let mut task = NodeTaskStatus::new("na-1", "n1", "VerifyConfiguration", json!({}));
        task.transition(crate::model::NodeTaskState::AwaitingReadiness).unwrap();
        task.transition(crate::model::NodeTaskState::NotReadyForTask).unwrap();
        let na = NodeAction::new("Verification", "VerifyConfiguration", 0, vec![task]);
        assert!(na.all_tasks_terminal());
    }
}
