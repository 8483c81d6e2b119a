//! # Master<->Slave Wire Message Contract (spec §6)
//!
//! Field names here are part of the wire contract and must not be renamed
//! casually — external slave implementations bind to them by name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Slave -> Master: initial registration on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRegistration {
    pub agent_name: String,
    pub agent_version: Option<String>,
    pub os_description: Option<String>,
    pub framework_description: Option<String>,
    pub max_concurrent_tasks: u32,
    pub hostname: Option<String>,
}

/// Slave -> Master: periodic liveness + load report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
    pub active_tasks: u32,
    pub available_task_slots: u32,
    pub cpu_usage_percent: Option<f32>,
    pub ram_usage_percent: Option<f32>,
}

/// Master -> Slave: Phase 1 readiness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareForTask {
    pub node_action_id: String,
    pub task_id: String,
    pub expected_task_type: String,
    pub target_resource: Option<String>,
    pub preparation_parameters_json: Value,
}

/// Slave -> Master: response to `PrepareForTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReadinessReport {
    pub node_action_id: String,
    pub task_id: String,
    pub node_name: String,
    pub is_ready: bool,
    pub reason_if_not_ready: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
}

/// Master -> Slave: Phase 2 execute instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTaskInstruction {
    pub node_action_id: String,
    pub task_id: String,
    pub task_type: String,
    pub parameters_json: Value,
}

/// Slave -> Master: progress/terminal update during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressUpdate {
    pub node_action_id: String,
    pub task_id: String,
    pub node_name: String,
    /// String form of one of the §4.6 NodeTask states.
    pub status: String,
    pub message: Option<String>,
    pub progress_percent: u8,
    pub result_json: Option<Value>,
    pub timestamp_utc: DateTime<Utc>,
}

/// Master -> Slave: cancel a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub node_action_id: String,
    pub task_id: String,
}

/// Slave -> Master: correlated task/stage log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub node_action_id: String,
    pub task_id: Option<String>,
    pub node_name: String,
    pub level: String,
    pub message: String,
    pub timestamp_utc: DateTime<Utc>,
}

/// Master -> Slave: log-flush handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFlushRequest {
    pub node_action_id: String,
}

/// Slave -> Master: log-flush handshake confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFlushConfirmation {
    pub node_action_id: String,
    pub node_name: String,
}

/// Master -> Slave: opaque pass-through, not interpreted by the core (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustSystemTimeCommand {
    pub payload_json: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_round_trip_through_json() {
        let hb = Heartbeat {
            node_name: "n1".to_string(),
            timestamp: Utc::now(),
            active_tasks: 1,
            available_task_slots: 3,
            cpu_usage_percent: Some(12.5),
            ram_usage_percent: Some(40.0),
        };
        let json = serde_json::to_string(&hb).unwrap();
        let back: Heartbeat = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_name, "n1");
        assert_eq!(back.active_tasks, 1);
    }

    #[test]
    fn task_progress_update_field_names_are_stable() {
        let update = TaskProgressUpdate {
            node_action_id: "na-1".to_string(),
            task_id: "t-1".to_string(),
            node_name: "n1".to_string(),
            status: "InProgress".to_string(),
            message: Some("working".to_string()),
            progress_percent: 42,
            result_json: None,
            timestamp_utc: Utc::now(),
        };
        let v = serde_json::to_value(&update).unwrap();
        assert_eq!(v["node_action_id"], "na-1");
        assert_eq!(v["progress_percent"], 42);
    }
}
