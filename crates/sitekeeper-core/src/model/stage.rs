//! `StageRecord` (spec §3): persistent history of one stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node_action::NodeAction;

/// Persistent history of one completed or in-progress stage of a MasterAction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_index: usize,
    pub stage_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_success: bool,
    pub final_node_actions: Vec<NodeAction>,
    pub custom_result: Option<Value>,
}

impl StageRecord {
    pub fn open(stage_index: usize, stage_name: impl Into<String>) -> Self {
        Self {
            stage_index,
            stage_name: stage_name.into(),
            start_time: Utc::now(),
            end_time: None,
            is_success: false,
            final_node_actions: Vec::new(),
            custom_result: None,
        }
    }

    pub fn close(&mut self, is_success: bool) {
        self.end_time = Some(Utc::now());
        self.is_success = is_success;
    }
}
