//! `MasterAction` (spec §3): a top-level workflow instance.

use std::collections::{HashMap, VecDeque};
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stage::StageRecord;

const RECENT_LOGS_CAPACITY: usize = 1000;

/// Top-level workflow state (§4.8's lifecycle, §4.7's terminal setters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Initiated,
    InProgress,
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl OverallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One entry of the `recentLogs` ring buffer (§3, §4.7 `logInfo/logWarning/logError`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// A top-level workflow instance the operator launched (§3 `MasterAction`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterAction {
    pub id: String,
    pub operation_type: String,
    pub name: Option<String>,
    pub initiated_by: Option<String>,
    pub parameters: HashMap<String, Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub overall_status: OverallStatus,
    pub overall_progress_percent: u8,
    pub final_result_payload: Option<Value>,
    pub execution_history: Vec<StageRecord>,

    // Transient fields (§3: "transient ... for live UI"), excluded from the
    // terminal journal snapshot per §4.4.
    pub current_stage_name: Option<String>,
    pub current_stage_index: Option<usize>,
    pub current_stage_node_action_ids: BTreeSet<String>,
    pub recent_logs: VecDeque<LogEntry>,

    terminal_set: bool,
}

impl MasterAction {
    pub fn new(operation_type: impl Into<String>, parameters: HashMap<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            name: None,
            initiated_by: None,
            parameters,
            start_time: Utc::now(),
            end_time: None,
            overall_status: OverallStatus::Initiated,
            overall_progress_percent: 0,
            final_result_payload: None,
            execution_history: Vec::new(),
            current_stage_name: None,
            current_stage_index: None,
            current_stage_node_action_ids: BTreeSet::new(),
            recent_logs: VecDeque::new(),
            terminal_set: false,
        }
    }

    pub fn push_log(&mut self, level: impl Into<String>, message: impl Into<String>) {
        if self.recent_logs.len() >= RECENT_LOGS_CAPACITY {
            self.recent_logs.pop_front();
        }
        self.recent_logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
        });
    }

    /// Progress is monotonic at the MasterAction level (§7 invariant 5).
    pub fn set_progress_percent(&mut self, percent: u8) {
        if percent > self.overall_progress_percent {
            self.overall_progress_percent = percent;
        }
    }

    /// Terminal setters are idempotent after the first terminal call (§4.7).
    fn set_terminal(&mut self, status: OverallStatus, message: impl Into<String>) {
        if self.terminal_set {
            return;
        }
        self.terminal_set = true;
        self.overall_status = status;
        self.end_time = Some(Utc::now());
        self.push_log("info", message);
    }

    pub fn set_completed(&mut self, message: impl Into<String>) {
        self.set_terminal(OverallStatus::Succeeded, message);
    }

    pub fn set_failed(&mut self, message: impl Into<String>) {
        self.set_terminal(OverallStatus::Failed, message);
    }

    pub fn set_cancelled(&mut self, message: impl Into<String>) {
        self.set_terminal(OverallStatus::Cancelled, message);
    }

    pub fn set_final_result(&mut self, payload: Value) {
        self.final_result_payload = Some(payload);
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_setters_are_idempotent() {
        let mut action = MasterAction::new("EnvVerify", HashMap::new());
        action.set_completed("done");
        let first_end_time = action.end_time;
        assert_eq!(action.overall_status, OverallStatus::Succeeded);

        action.set_failed("should not override");
        assert_eq!(action.overall_status, OverallStatus::Succeeded);
        assert_eq!(action.end_time, first_end_time);
    }

    #[test]
    fn progress_never_decreases() {
        let mut action = MasterAction::new("EnvVerify", HashMap::new());
        action.set_progress_percent(50);
        action.set_progress_percent(30);
        assert_eq!(action.overall_progress_percent, 50);
        action.set_progress_percent(75);
        assert_eq!(action.overall_progress_percent, 75);
    }

    #[test]
    fn recent_logs_ring_buffer_respects_capacity() {
        let mut action = MasterAction::new("EnvVerify", HashMap::new());
        for i in 0..(RECENT_LOGS_CAPACITY + 10) {
            action.push_log("info", format!("line {i}"));
        }
        assert_eq!(action.recent_logs.len(), RECENT_LOGS_CAPACITY);
        assert_eq!(action.recent_logs.front().unwrap().message, "line 10");
    }
}
